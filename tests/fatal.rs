//! The process-terminating boundary, exercised in a child process.

use rdsm::{Cluster, ClusterConfig, SimFabric, exit_on_error};
use std::process::Command;

const CHILD_ENV: &str = "RDSM_FATAL_CHILD";

#[test]
fn test_self_destination_terminates_process() {
    if std::env::var_os(CHILD_ENV).is_some() {
        let server = Cluster::new(SimFabric::new(), ClusterConfig::local(1, 4096), 0).unwrap();
        server.start_server().unwrap();
        server.server_ready().unwrap();
        exit_on_error(server.write(0, 0, 8));
        unreachable!("write to self must not succeed");
    }

    let exe = std::env::current_exe().unwrap();
    let output = Command::new(exe)
        .env(CHILD_ENV, "1")
        .args([
            "--exact",
            "test_self_destination_terminates_process",
            "--nocapture",
        ])
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("same as local ID"), "stderr: {stderr}");
}
