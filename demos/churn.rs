use std::time::{Duration, Instant};

use fission::{Config, DeferSafepoint};

fn main() {
    let collector = fission::init(Config {
        verbose: true,
        ptrs_per_thread: 1024,
        ..Default::default()
    })
    .unwrap();

    println!("Spawning 4 mutators");
    let mut handles = vec![];
    for _ in 0..4 {
        handles.push(std::thread::spawn(|| {
            fission::register_current_thread();

            let mut i = 0u64;
            while i < 2_000_000 {
                // Allocate and retire in deferred bursts, the way an
                // allocator shim would; the thread parks for snapshots
                // between bursts.
                let defer = DeferSafepoint::new();
                for _ in 0..1024 {
                    unsafe {
                        let block = libc::malloc(48) as *mut u64;
                        block.write(i);
                        std::hint::black_box(block);
                        fission::retire(block as *mut _);
                    }
                    i += 1;
                }
                drop(defer);
            }

            fission::flush_retired();
            fission::unregister_thread();
        }));
    }

    let start = std::time::Instant::now();
    for handle in handles {
        handle.join().unwrap();
    }

    // Give the tail batches one more cycle to complete.
    let target = collector.cycles() + 1;
    let deadline = Instant::now() + Duration::from_secs(5);
    while collector.cycles() < target && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(1));
    }

    println!("Finished in {:.4} secs", start.elapsed().as_secs_f64());
    fission::print_statistics();
    println!("{}", collector.statistics());
}
