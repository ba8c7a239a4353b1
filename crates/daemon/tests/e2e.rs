use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use data_encoding::BASE64URL_NOPAD;
use serde_json::json;
use warden_core::engine::basic::{BasicEngine, BasicEngineFactory};
use warden_core::{Engine, EngineError, EngineFactory, EngineSettings, TelemetrySettings};
use warden_daemon::protocol::{
    ClientInitArgs, ConfigSyncArgs, InitStatus, RemoteConfigArgs, RequestExecArgs,
    RequestInitArgs, RequestShutdownArgs, VerdictKind,
};
use warden_daemon::{
    Client, Command, DaemonConfig, ProtocolError, Response, ShutdownToken, SocketAddress,
};

struct Daemon {
    address: SocketAddress,
    token: ShutdownToken,
    handle: JoinHandle<eyre::Result<()>>,
}

impl Daemon {
    fn start(dir: &Path, factory: Arc<dyn EngineFactory>) -> Self {
        let address = SocketAddress::Path(dir.join("warden.sock"));
        let config = DaemonConfig {
            socket: address.clone(),
            accept_timeout: Duration::from_millis(20),
            rc_poll_interval: Duration::ZERO,
            pid_file: None,
            ..DaemonConfig::default()
        };
        let token = ShutdownToken::new();
        let handle = {
            let token = token.clone();
            std::thread::spawn(move || warden_daemon::run(&config, factory, &token))
        };

        let deadline = Instant::now() + Duration::from_secs(5);
        while !warden_daemon::is_helper_running(&address) {
            assert!(Instant::now() < deadline, "daemon failed to start");
            std::thread::sleep(Duration::from_millis(10));
        }
        Self {
            address,
            token,
            handle,
        }
    }

    fn connect(&self) -> Client {
        Client::connect(&self.address, Duration::from_secs(5)).unwrap()
    }

    fn stop(self) {
        self.token.cancel();
        self.handle.join().unwrap().unwrap();
    }
}

#[derive(Default)]
struct CountingFactory {
    built: AtomicUsize,
}

impl EngineFactory for CountingFactory {
    fn build(&self, _settings: &EngineSettings) -> Result<Arc<dyn Engine>, EngineError> {
        self.built.fetch_add(1, Ordering::SeqCst);
        // Widen the window in which a second builder could race in.
        std::thread::sleep(Duration::from_millis(50));
        Ok(Arc::new(BasicEngine::bundled()?))
    }
}

fn client_init(enabled: Option<bool>, rc_path: Option<&Path>) -> Command {
    Command::ClientInit(ClientInitArgs {
        pid: std::process::id(),
        client_version: "1.2.3".into(),
        runtime_version: "8.3".into(),
        enabled,
        remote_config_settings: RemoteConfigArgs {
            enabled: rc_path.is_some(),
            path: rc_path.map(|p| p.display().to_string()).unwrap_or_default(),
        },
        telemetry_settings: TelemetrySettings {
            service_name: "checkout".into(),
            env_name: "prod".into(),
        },
        runtime_id: "rt-1".into(),
        ..ClientInitArgs::default()
    })
}

fn write_index(dir: &Path, configs: &[(&str, serde_json::Value)]) -> PathBuf {
    let mut index = String::from("rt-1\n");
    for (i, (rc_path, contents)) in configs.iter().enumerate() {
        let file = dir.join(format!("rc-{i}.json"));
        std::fs::write(&file, contents.to_string()).unwrap();
        index.push_str(&format!(
            "{}:0:{}\n",
            file.display(),
            BASE64URL_NOPAD.encode(rc_path.as_bytes())
        ));
    }
    let path = dir.join("rc-index");
    std::fs::write(&path, index).unwrap();
    path
}

fn shutdown_request() -> Command {
    Command::RequestShutdown(RequestShutdownArgs {
        data: json!({"server.response.status": "200"}),
        api_sec_samp_key: 0,
    })
}

#[test]
fn request_lifecycle_returns_to_idle() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = Daemon::start(dir.path(), Arc::new(BasicEngineFactory));
    let mut client = daemon.connect();

    let Response::ClientInit(init) = client.call(&client_init(Some(true), None)).unwrap() else {
        panic!("expected client_init response");
    };
    assert_eq!(init.status, InitStatus::Ok);
    assert_eq!(init.version, "1.0.0");

    let init_req = Command::RequestInit(RequestInitArgs {
        data: json!({"http.client_ip": "10.0.0.1"}),
    });
    let Response::RequestInit(verdict) = client.call(&init_req).unwrap() else {
        panic!("expected request_init response");
    };
    assert_eq!(verdict.verdicts(), vec![VerdictKind::Ok]);

    let exec = Command::RequestExec(RequestExecArgs {
        data: json!({"server.request.headers.user-agent": ["sqlmap/1.7.2#stable"]}),
        rasp_rule: None,
    });
    let Response::RequestExec(verdict) = client.call(&exec).unwrap() else {
        panic!("expected request_exec response");
    };
    assert_eq!(verdict.verdicts(), vec![VerdictKind::Record]);
    assert_eq!(verdict.triggers[0]["rule"]["id"], "ua0-600-55x");

    let Response::RequestShutdown(verdict) = client.call(&shutdown_request()).unwrap() else {
        panic!("expected request_shutdown response");
    };
    assert_eq!(verdict.verdicts(), vec![VerdictKind::Ok]);

    assert!(matches!(
        client.call(&init_req).unwrap(),
        Response::RequestInit(_)
    ));
    assert!(matches!(
        client.call(&shutdown_request()).unwrap(),
        Response::RequestShutdown(_)
    ));

    drop(client);
    daemon.stop();
}

#[test]
fn concurrent_client_init_builds_one_service() {
    let dir = tempfile::tempdir().unwrap();
    let factory = Arc::new(CountingFactory::default());
    let daemon = Daemon::start(dir.path(), factory.clone());

    let clients: Vec<Client> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..4)
            .map(|_| {
                s.spawn(|| {
                    let mut client = daemon.connect();
                    let response = client.call(&client_init(Some(true), None)).unwrap();
                    assert!(matches!(
                        response,
                        Response::ClientInit(ref r) if r.status == InitStatus::Ok
                    ));
                    client
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(factory.built.load(Ordering::SeqCst), 1);
    drop(clients);
    daemon.stop();
}

#[test]
fn request_exec_before_client_init_closes_connection() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = Daemon::start(dir.path(), Arc::new(BasicEngineFactory));
    let mut client = daemon.connect();

    let exec = Command::RequestExec(RequestExecArgs::default());
    assert_eq!(client.call(&exec).unwrap(), Response::Error {});
    assert!(matches!(
        client.call(&client_init(Some(true), None)),
        Err(ProtocolError::Disconnected | ProtocolError::Io(_))
    ));

    daemon.stop();
}

#[test]
fn second_client_init_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = Daemon::start(dir.path(), Arc::new(BasicEngineFactory));
    let mut client = daemon.connect();

    assert!(matches!(
        client.call(&client_init(Some(true), None)).unwrap(),
        Response::ClientInit(_)
    ));
    assert_eq!(
        client.call(&client_init(Some(true), None)).unwrap(),
        Response::Error {}
    );

    daemon.stop();
}

#[test]
fn remote_config_blocks_listed_ip() {
    let dir = tempfile::tempdir().unwrap();
    let index = write_index(
        dir.path(),
        &[
            (
                "datadog/2/ASM_FEATURES/asm_features_activation/config",
                json!({"asm": {"enabled": true}}),
            ),
            (
                "datadog/2/ASM_DATA/blocked_ips/config",
                json!({"rules_data": [{
                    "id": "blocked_ips",
                    "type": "ip_with_expiration",
                    "data": [{"value": "192.0.2.7"}]
                }]}),
            ),
        ],
    );
    let daemon = Daemon::start(dir.path(), Arc::new(BasicEngineFactory));
    let mut client = daemon.connect();

    // No explicit `enabled`: activation comes from ASM_FEATURES.
    let Response::ClientInit(init) = client.call(&client_init(None, Some(&index))).unwrap() else {
        panic!("expected client_init response");
    };
    assert_eq!(init.status, InitStatus::Ok);

    let sync = Command::ConfigSync(ConfigSyncArgs {
        rem_cfg_path: index.display().to_string(),
        telemetry_settings: TelemetrySettings {
            service_name: "checkout".into(),
            env_name: "prod".into(),
        },
    });
    assert_eq!(
        client.call(&sync).unwrap(),
        Response::ConfigFeatures { enabled: true }
    );

    let req = Command::RequestInit(RequestInitArgs {
        data: json!({"http.client_ip": "192.0.2.7"}),
    });
    let Response::RequestInit(verdict) = client.call(&req).unwrap() else {
        panic!("expected request_init response");
    };
    assert_eq!(verdict.verdicts(), vec![VerdictKind::Block]);
    assert!(verdict.force_keep);

    let Response::RequestShutdown(verdict) = client.call(&shutdown_request()).unwrap() else {
        panic!("expected request_shutdown response");
    };
    assert_eq!(verdict.verdicts(), vec![VerdictKind::Ok]);

    drop(client);
    daemon.stop();
}

#[test]
fn client_init_failure_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = Daemon::start(dir.path(), Arc::new(BasicEngineFactory));
    let mut client = daemon.connect();

    let command = Command::ClientInit(ClientInitArgs {
        engine_settings: EngineSettings {
            rules_file: Some(dir.path().join("missing.json").display().to_string()),
            ..EngineSettings::default()
        },
        ..ClientInitArgs::default()
    });
    let Response::ClientInit(init) = client.call(&command).unwrap() else {
        panic!("expected client_init response");
    };
    assert_eq!(init.status, InitStatus::Fail);
    assert!(init.errors[0].contains("missing.json"));

    daemon.stop();
}
