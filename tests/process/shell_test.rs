/*!
 * Shell Helper Tests
 */

use rpc_agent::core::types::WaitStatus;
use rpc_agent::process::{install_reaper, popen, system};
use serial_test::serial;

#[test]
#[serial]
fn test_system_reports_exit_code() {
    install_reaper(16).unwrap();

    assert_eq!(WaitStatus::from_raw(system("true").unwrap()), WaitStatus::Exited(0));
    assert_eq!(WaitStatus::from_raw(system("exit 42").unwrap()), WaitStatus::Exited(42));
}

#[test]
#[serial]
fn test_system_reports_signal() {
    install_reaper(16).unwrap();

    match WaitStatus::from_raw(system("kill -9 $$").unwrap()) {
        WaitStatus::Signaled { signal, .. } => assert_eq!(signal, libc::SIGKILL),
        other => panic!("unexpected status {:?}", other),
    }
}

#[test]
#[serial]
fn test_popen_collects_stdout() {
    install_reaper(16).unwrap();

    assert_eq!(popen("printf 'a\\nb\\n'").unwrap(), "a\nb\n");
    assert!(popen("echo partial; exit 2").is_err());
}
