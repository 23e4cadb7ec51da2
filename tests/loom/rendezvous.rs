#![cfg(loom)]

use loom::sync::Arc;
use loom::thread;
use posix_shim::sync::Rendezvous;

#[test]
fn exactly_one_last_arriver() {
  loom::model(|| {
    let rendezvous: Arc<Rendezvous> = Arc::new(Rendezvous::new());

    let other = {
      let rendezvous: Arc<Rendezvous> = Arc::clone(&rendezvous);
      thread::spawn(move || rendezvous.arrive())
    };

    let this: bool = rendezvous.arrive();
    let that: bool = other.join().unwrap();

    assert!(this ^ that, "expected exactly one last arriver, got {this} and {that}");
    assert_eq!(rendezvous.arrivals(), 2);
  });
}
