#![cfg(loom)]

use loom::sync::Arc;
use loom::sync::atomic::AtomicUsize;
use loom::sync::atomic::Ordering;
use loom::thread;
use posix_shim::sync::ClaimFlag;

#[test]
fn single_owner() {
  loom::model(|| {
    let flag: Arc<ClaimFlag> = Arc::new(ClaimFlag::new());
    let owners: Arc<AtomicUsize> = Arc::new(AtomicUsize::new(0));

    let threads: Vec<_> = (0..2)
      .map(|_| {
        let flag: Arc<ClaimFlag> = Arc::clone(&flag);
        let owners: Arc<AtomicUsize> = Arc::clone(&owners);

        thread::spawn(move || {
          if flag.try_claim() {
            owners.fetch_add(1, Ordering::SeqCst);
          }
        })
      })
      .collect();

    for handle in threads {
      handle.join().unwrap();
    }

    assert_eq!(owners.load(Ordering::SeqCst), 1, "flag claimed twice!");
  });
}

#[test]
fn release_hands_over() {
  loom::model(|| {
    let flag: Arc<ClaimFlag> = Arc::new(ClaimFlag::claimed());
    let value: Arc<AtomicUsize> = Arc::new(AtomicUsize::new(0));

    let t1 = {
      let flag: Arc<ClaimFlag> = Arc::clone(&flag);
      let value: Arc<AtomicUsize> = Arc::clone(&value);

      thread::spawn(move || {
        value.store(1, Ordering::Relaxed);
        flag.release();
      })
    };

    let t2 = {
      let flag: Arc<ClaimFlag> = Arc::clone(&flag);
      let value: Arc<AtomicUsize> = Arc::clone(&value);

      thread::spawn(move || {
        if flag.try_claim() {
          // The previous owner's writes are visible to the next owner.
          assert_eq!(value.load(Ordering::Relaxed), 1, "claimed before release!");
          true
        } else {
          false
        }
      })
    };

    t1.join().unwrap();

    if !t2.join().unwrap() {
      assert!(flag.try_claim(), "released flag not claimable");
    }
  });
}
