//! Helper program for the process-level tests
//!
//! Every scenario calls `wrap` itself, so the test spawns this binary once
//! and it relaunches itself as its own payload. The handler reports
//! `wrapped: <capture length>` on stdout and exits 0.

use std::io::{self, BufRead, Write};
use std::process::{self, Command};
use std::thread;
use std::time::Duration;

use crashwrap_core::{wrap, wrapped, Capture, WrapConfig, WrapOutcome, TOKEN_ENV_KEY};

fn report_capture(capture: &Capture) {
    print!("wrapped: {}", capture.len());
    let _ = io::stdout().flush();
    process::exit(0);
}

/// Wrap with `config`; exits the supervisor with the child's status
fn wrap_or_exit(config: &WrapConfig) {
    match wrap(config) {
        Ok(WrapOutcome::Payload) => {}
        Ok(WrapOutcome::Supervisor { exit_status, .. }) => process::exit(exit_status),
        Err(e) => {
            eprint!("wrap error: {}", e);
            process::exit(1);
        }
    }
}

/// Wrap with `config`; the supervisor prints the child's status and exits 0
fn wrap_or_report_status(config: &WrapConfig) {
    match wrap(config) {
        Ok(WrapOutcome::Payload) => {}
        Ok(WrapOutcome::Supervisor { exit_status, .. }) => {
            print!("status: {}", exit_status);
            let _ = io::stdout().flush();
            process::exit(0);
        }
        Err(e) => {
            eprint!("wrap error: {}", e);
            process::exit(1);
        }
    }
}

fn flush_stderr() {
    let _ = io::stderr().flush();
}

#[allow(unconditional_recursion)]
fn overflow(depth: u64) -> u64 {
    let frame = std::hint::black_box([depth as u8; 1024]);
    overflow(depth + 1) + frame[0] as u64
}

/// Count SIGINT deliveries in the payload and print the total
#[cfg(unix)]
fn count_interrupts() -> ! {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Instant;

    let count = Arc::new(AtomicUsize::new(0));
    let mut signals = match signal_hook::iterator::Signals::new([libc::SIGINT]) {
        Ok(signals) => signals,
        Err(e) => {
            eprint!("signal error: {}", e);
            process::exit(1);
        }
    };
    let seen = Arc::clone(&count);
    thread::spawn(move || {
        for _ in signals.forever() {
            seen.fetch_add(1, Ordering::SeqCst);
        }
    });

    println!("ready");
    let _ = io::stdout().flush();

    let deadline = Instant::now() + Duration::from_secs(5);
    while count.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    // Room for a second delivery to land
    thread::sleep(Duration::from_millis(300));

    print!("count: {}", count.load(Ordering::SeqCst));
    let _ = io::stdout().flush();
    process::exit(0);
}

#[cfg(not(unix))]
fn count_interrupts() -> ! {
    eprintln!("sigint-count needs Unix");
    process::exit(2);
}

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let (cmd, args) = match args.split_first() {
        Some((cmd, rest)) => (cmd.as_str(), rest),
        None => {
            eprintln!("No command");
            process::exit(2);
        }
    };
    let arg = |i: usize| args.get(i).map(String::as_str);

    match cmd {
        "no-panic-output" => {
            wrap_or_exit(&WrapConfig::new(report_capture));
            print!("i am output");
            eprint!("stderr out");
            process::exit(0);
        }
        "exit-code" => {
            let code: i32 = arg(0).and_then(|c| c.parse().ok()).unwrap_or(0);
            wrap_or_exit(&WrapConfig::new(report_capture));
            println!("plain stdout");
            eprintln!("plain stderr, not a panic: really");
            process::exit(code);
        }
        "panic" => {
            let hide = arg(0) == Some("hide");
            wrap_or_exit(&WrapConfig::new(report_capture).hide_capture(hide));
            panic!("uh oh");
        }
        "panic-chunked" => {
            wrap_or_exit(&WrapConfig::new(report_capture).hide_capture(true));
            eprintln!("warming up");
            for byte in b"panic: split\n".iter() {
                io::stderr().write_all(&[*byte]).ok();
                flush_stderr();
                thread::sleep(Duration::from_millis(2));
            }
            eprintln!("goroutine 1 [running]:");
            process::exit(2);
        }
        "panic-long" => {
            wrap_or_exit(&WrapConfig::new(report_capture));
            eprint!("panic: foo\n\n");
            for _ in 0..1024 {
                eprint!("foobarbaz");
            }
            thread::sleep(Duration::from_millis(500));
            panic!("I AM REAL!");
        }
        "boundary" => {
            // Optional patience override in milliseconds
            let mut config = WrapConfig::new(report_capture);
            if let Some(ms) = arg(0).and_then(|ms| ms.parse().ok()) {
                config = config.patience(Some(Duration::from_millis(ms)));
            }
            wrap_or_report_status(&config);
            eprint!("pan");
            flush_stderr();
            thread::sleep(Duration::from_millis(100));
            eprintln!("ic: boom");
            process::exit(2);
        }
        "thread-panic" => {
            let config = WrapConfig::new(|capture: &Capture| {
                let text = capture.text();
                print!(
                    "wrapped: {} tail: {}",
                    capture.len(),
                    text.contains("still alive")
                );
                let _ = io::stdout().flush();
                process::exit(0);
            })
            .hide_capture(true)
            .quiet_period(Some(Duration::from_millis(100)));
            wrap_or_exit(&config);

            let worker = thread::Builder::new()
                .name("worker".into())
                .spawn(|| panic!("worker gave up"));
            if let Ok(worker) = worker {
                let _ = worker.join();
            }
            thread::sleep(Duration::from_millis(400));
            eprintln!("still alive");
            process::exit(0);
        }
        "overflow" => {
            wrap_or_exit(&WrapConfig::new(report_capture).hide_capture(true));
            println!("{}", overflow(0));
        }
        "abort" => {
            wrap_or_report_status(&WrapConfig::new(report_capture).signatures(["NEVER"]));
            process::abort();
        }
        "sigterm" => {
            wrap_or_report_status(&WrapConfig::new(report_capture));
            println!("ready");
            let _ = io::stdout().flush();
            thread::sleep(Duration::from_secs(10));
            process::exit(0);
        }
        "sigint-count" => {
            wrap_or_exit(&WrapConfig::new(report_capture));
            count_interrupts();
        }
        "stdin" => {
            wrap_or_exit(&WrapConfig::new(report_capture));
            let mut line = String::new();
            let _ = io::stdin().lock().read_line(&mut line);
            print!("echo: {}", line.trim_end());
            process::exit(0);
        }
        "wrapped" => {
            let child = arg(0) == Some("child");
            let config = WrapConfig::new(report_capture);
            let outcome = match wrap(&config) {
                Ok(outcome) => outcome,
                Err(e) => {
                    eprint!("wrap error: {}", e);
                    process::exit(1);
                }
            };

            let has_token = std::env::var_os(TOKEN_ENV_KEY).is_some();
            match outcome {
                WrapOutcome::Payload => {
                    if child {
                        print!(
                            "{} config: {} token: {}",
                            wrapped(None),
                            wrapped(Some(&config)),
                            has_token
                        );
                    }
                    let _ = io::stdout().flush();
                    process::exit(0);
                }
                WrapOutcome::Supervisor { exit_status, .. } => {
                    if !child {
                        print!(
                            "{} config: {} token: {}",
                            wrapped(None),
                            wrapped(Some(&config)),
                            has_token
                        );
                    }
                    let _ = io::stdout().flush();
                    process::exit(exit_status);
                }
            }
        }
        "recursive" => {
            let config = WrapConfig::new(report_capture);

            if arg(0) == Some("child") {
                // Started by the payload, not by a supervisor
                print!("fresh: {} global: {}", wrapped(Some(&config)), wrapped(None));
                let _ = io::stdout().flush();
                process::exit(0);
            }

            let outcome = match wrap(&config) {
                Ok(outcome) => outcome,
                Err(e) => {
                    eprint!("wrap error: {}", e);
                    process::exit(1);
                }
            };

            if wrapped(None) {
                let status = std::env::current_exe()
                    .and_then(|exe| Command::new(exe).args(["recursive", "child"]).status());
                match status {
                    Ok(status) if status.success() => process::exit(0),
                    Ok(status) => {
                        eprint!("child failed: {}", status);
                        process::exit(1);
                    }
                    Err(e) => {
                        eprint!("spawn error: {}", e);
                        process::exit(1);
                    }
                }
            }

            // Supervisor: an unrelated configuration never reports wrapped
            let unrelated = WrapConfig::new(report_capture);
            print!(" supervisor-unrelated: {}", wrapped(Some(&unrelated)));
            let _ = io::stdout().flush();
            process::exit(outcome.exit_status().unwrap_or(1));
        }
        "rewrap" => {
            // Second wrap call in the payload takes the payload branch again
            let first = WrapConfig::new(report_capture);
            wrap_or_exit(&first);
            let second = WrapConfig::new(report_capture).hide_capture(true);
            match wrap(&second) {
                Ok(WrapOutcome::Payload) => print!(
                    "second: payload first: {} second: {}",
                    wrapped(Some(&first)),
                    wrapped(Some(&second))
                ),
                Ok(outcome) => print!("second: {:?}", outcome),
                Err(e) => print!("second: error {}", e),
            }
            let _ = io::stdout().flush();
            process::exit(0);
        }
        other => {
            eprintln!("Unknown command: {:?}", other);
            process::exit(2);
        }
    }
}
