/*!
 * Reaper Tests
 * Children collected by the SIGCHLD handler stay waitable
 */

use pretty_assertions::assert_eq;
use rpc_agent::core::types::{Pid, WaitStatus};
use rpc_agent::process::{install_reaper, kill_death, reaper, shell_cmd};
use serial_test::serial;
use std::process::Command;
use std::time::{Duration, Instant};

fn spawn_exit(code: i32) -> Pid {
    let child = Command::new("/bin/sh")
        .arg("-c")
        .arg(format!("exit {}", code))
        .spawn()
        .unwrap();
    child.id() as Pid
}

fn wait_pending(count: usize) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while reaper().pending().len() < count {
        assert!(Instant::now() < deadline, "children were not harvested");
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[test]
#[serial]
fn test_ten_children_reaped() {
    install_reaper(16).unwrap();

    let pids: Vec<Pid> = (0..10).map(spawn_exit).collect();
    wait_pending(10);

    let mut codes = Vec::new();
    for _ in 0..10 {
        let (got, status) = reaper().waitpid(-1, 0).unwrap().unwrap();
        assert!(pids.contains(&got));
        match WaitStatus::from_raw(status) {
            WaitStatus::Exited(code) => codes.push(code),
            other => panic!("unexpected status {:?}", other),
        }
    }
    codes.sort_unstable();
    assert_eq!(codes, (0..10).collect::<Vec<i32>>());
    assert!(reaper().pending().is_empty());
}

#[test]
#[serial]
fn test_status_by_pid() {
    install_reaper(16).unwrap();

    let pids: Vec<Pid> = (0..3).map(|code| spawn_exit(code + 20)).collect();
    wait_pending(3);

    for (i, pid) in pids.iter().enumerate().rev() {
        let (got, status) = reaper().waitpid(*pid, 0).unwrap().unwrap();
        assert_eq!(got, *pid);
        assert_eq!(WaitStatus::from_raw(status), WaitStatus::Exited(i as i32 + 20));
    }
}

#[test]
#[serial]
fn test_status_is_consumed_once() {
    install_reaper(16).unwrap();

    let pid = spawn_exit(7);
    wait_pending(1);

    assert!(reaper().waitpid(pid, 0).unwrap().is_some());
    assert!(reaper().waitpid(pid, 0).is_err());
}

#[test]
#[serial]
fn test_wait_any_child() {
    install_reaper(16).unwrap();

    let pid = spawn_exit(0);
    wait_pending(1);

    let (got, _) = reaper().waitpid(-1, 0).unwrap().unwrap();
    assert_eq!(got, pid);
}

#[test]
#[serial]
fn test_nohang_on_live_child() {
    install_reaper(16).unwrap();

    let (pid, _) = shell_cmd("sleep 30", false).unwrap();
    assert_eq!(reaper().waitpid(pid, libc::WNOHANG).unwrap(), None);

    kill_death(pid).unwrap();
    assert!(reaper().waitpid(pid, libc::WNOHANG).is_err());
}
