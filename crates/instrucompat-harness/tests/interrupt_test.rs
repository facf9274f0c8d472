//! Signal-driven cancellation. Kept in its own test binary because the
//! handler is process-wide.
#![cfg(unix)]

use std::process::Command;
use std::thread;
use std::time::{Duration, Instant};

use instrucompat_harness::process::CancelToken;

#[test]
fn interrupt_signal_cancels_the_run_token() {
    let token = CancelToken::new();
    token.cancel_on_interrupt().unwrap();
    assert!(!token.is_cancelled());

    let status = Command::new("kill")
        .args(["-INT", &std::process::id().to_string()])
        .status()
        .unwrap();
    assert!(status.success());

    let deadline = Instant::now() + Duration::from_secs(5);
    while !token.is_cancelled() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert!(token.is_cancelled());
    assert!(token.check("after interrupt").is_err());
}
