// Watchdog wrapper that ties a worker's lifetime to its master's.
//
// Launched as: worker_watchdog --master-pid <PID> -- <command> [args...]
// The wrapped command inherits our stdio, so its output lands in whatever
// log the master redirected us into. We poll the master PID and take the
// worker's whole process tree down if the master disappears — even a master
// that crashed without running its own cleanup path.

use std::process::{Command, ExitCode};

use shardpool::web::constants::WORKER_CHECK_INTERVAL;
use shardpool::web::worker::supervisor;

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let (master_pid, command) = match parse_args(&args) {
        Some(parsed) => parsed,
        None => {
            eprintln!("Usage: worker_watchdog --master-pid <PID> -- <command> [args...]");
            return ExitCode::from(2);
        }
    };

    let mut child = match Command::new(&command[0]).args(&command[1..]).spawn() {
        Ok(child) => child,
        Err(e) => {
            eprintln!("[Watchdog] Failed to start worker command: {e}");
            return ExitCode::from(1);
        }
    };
    eprintln!("[Watchdog] Monitoring master PID: {master_pid}");

    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                // Worker finished on its own; mirror its exit code.
                let code = status.code().unwrap_or(0).clamp(0, 255) as u8;
                return ExitCode::from(code);
            }
            Ok(None) => {}
            Err(e) => {
                eprintln!("[Watchdog] Wait on worker failed: {e}");
            }
        }

        if !supervisor::is_alive(master_pid) {
            eprintln!("[Watchdog] Master (PID {master_pid}) is gone, stopping worker");
            supervisor::kill_tree(child.id());
            let _ = child.wait();
            return ExitCode::SUCCESS;
        }

        std::thread::sleep(WORKER_CHECK_INTERVAL);
    }
}

fn parse_args(args: &[String]) -> Option<(u32, Vec<String>)> {
    let mut master_pid: Option<u32> = None;
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--master-pid" => {
                master_pid = args.get(i + 1)?.parse().ok();
                if master_pid.is_none() {
                    return None;
                }
                i += 2;
            }
            "--" => {
                let command = args[i + 1..].to_vec();
                if command.is_empty() {
                    return None;
                }
                return Some((master_pid?, command));
            }
            _ => return None,
        }
    }
    None
}
