//! Remote host configuration shared by integration tests.

use berth::RemoteConfig;

/// Root login on a fixed host so scripts run without `sudo`.
pub fn remote_config() -> RemoteConfig {
    RemoteConfig {
        host: String::from("deploy.example.com"),
        ssh_user: String::from("root"),
        ssh_port: 22,
        ssh_bin: String::from("ssh"),
        scp_bin: String::from("scp"),
        ssh_batch_mode: true,
        ssh_strict_host_key_checking: true,
        ssh_known_hosts_file: String::new(),
        ssh_identity_file: None,
        staging_dir: String::from("/tmp"),
    }
}
