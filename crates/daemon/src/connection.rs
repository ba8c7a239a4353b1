//! Per-connection command loop.
//!
//! A connection moves `uninitialized -> idle <-> in_request` and is served
//! start to finish on one worker thread. Commands that do not fit the current
//! state get an `error` response and close the connection.

use std::collections::BTreeMap;
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tracing::{debug, info, trace, warn};
use warden_core::engine::{CONTEXT_PROCESSOR, EXTRACT_SCHEMA};
use warden_core::telemetry::MetricsCollector;
use warden_core::{ActionKind, EngineContext, EngineError, EngineResult, RemoteConfigSettings};
use warden_rc::AsmStatus;

use crate::protocol::{
    self, ClientInitArgs, ClientInitResponse, Command, ConfigSyncArgs, InitStatus,
    ProtocolError, RequestExecArgs, RequestInitArgs, RequestShutdownArgs, Response, Verdict,
    VerdictAction, VerdictKind,
};
use crate::service::{Service, ServiceSettings};
use crate::service_cache::ServiceCache;
use crate::shutdown::ShutdownToken;

/// A client that connects and says nothing is dropped after this long.
const FIRST_COMMAND_TIMEOUT: Duration = Duration::from_millis(500);

const AUTO_USER_INSTRUM: &str = "auto_user_instrum";

pub struct Connection {
    stream: UnixStream,
    cache: Arc<ServiceCache>,
    shutdown: ShutdownToken,
    service: Option<Arc<Service>>,
    context: Option<Box<dyn EngineContext>>,
    client_enabled: Option<bool>,
    client_version: String,
    runtime_id: String,
}

impl Connection {
    #[must_use]
    pub fn new(stream: UnixStream, cache: Arc<ServiceCache>, shutdown: ShutdownToken) -> Self {
        Self {
            stream,
            cache,
            shutdown,
            service: None,
            context: None,
            client_enabled: None,
            client_version: String::new(),
            runtime_id: String::new(),
        }
    }

    const fn state(&self) -> &'static str {
        match (&self.service, &self.context) {
            (None, _) => "uninitialized",
            (Some(_), None) => "idle",
            (Some(_), Some(_)) => "in_request",
        }
    }

    /// Serve commands until the peer leaves, misbehaves or the daemon shuts
    /// down.
    pub fn serve(mut self) {
        let _registration = self.shutdown.register(&self.stream);
        if let Err(e) = self.stream.set_read_timeout(Some(FIRST_COMMAND_TIMEOUT)) {
            warn!(%e, "cannot set read timeout");
        }

        let mut first = true;
        while !self.shutdown.is_cancelled() {
            let outcome =
                protocol::read_frame::<_, Command>(&mut self.stream).and_then(|command| {
                    if std::mem::take(&mut first) {
                        self.stream.set_read_timeout(None)?;
                    }
                    self.dispatch(command)
                });

            match outcome {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) if e.is_disconnect() => {
                    debug!(state = self.state(), "client went away");
                    break;
                }
                Err(e) => {
                    warn!(
                        %e,
                        state = self.state(),
                        client_version = %self.client_version,
                        runtime_id = %self.runtime_id,
                        "closing connection"
                    );
                    let _ = self.send(&Response::Error {});
                    break;
                }
            }
        }
        trace!("connection closed");
    }

    fn send(&mut self, response: &Response) -> Result<(), ProtocolError> {
        protocol::write_frame(&mut self.stream, response)
    }

    /// Handle one command; `Ok(false)` closes the connection.
    fn dispatch(&mut self, command: Command) -> Result<bool, ProtocolError> {
        trace!(command = command.name(), state = self.state(), "dispatch");
        let name = command.name();
        let unexpected = |state| ProtocolError::UnexpectedCommand {
            command: name,
            state,
        };

        if self.service.is_none() && !matches!(command, Command::ClientInit(_)) {
            return Err(unexpected("uninitialized"));
        }

        match command {
            Command::ClientInit(args) => {
                if self.service.is_some() {
                    return Err(unexpected(self.state()));
                }
                self.client_init(args)
            }
            Command::RequestInit(args) => {
                if self.context.is_some() {
                    return Err(unexpected("in_request"));
                }
                self.request_init(args)
            }
            Command::RequestExec(args) => {
                if self.context.is_none() {
                    return Err(unexpected("idle"));
                }
                self.request_exec(args)
            }
            Command::RequestShutdown(args) => {
                if self.context.is_none() {
                    return Err(unexpected("idle"));
                }
                self.request_shutdown(args)
            }
            Command::ConfigSync(args) => self.config_sync(args),
        }
    }

    // ─── Handlers ────────────────────────────────────────────────────────────

    fn client_init(&mut self, args: ClientInitArgs) -> Result<bool, ProtocolError> {
        info!(
            pid = args.pid,
            client_version = %args.client_version,
            runtime_version = %args.runtime_version,
            runtime_id = %args.runtime_id,
            "client_init"
        );
        let rc = &args.remote_config_settings;
        let remote_config = if rc.enabled && !rc.path.is_empty() {
            RemoteConfigSettings::from_sync_path(&rc.path)
        } else {
            RemoteConfigSettings::default()
        };
        let settings = ServiceSettings {
            engine: args.engine_settings,
            remote_config,
            telemetry: args.telemetry_settings,
        };

        let service = match self.cache.get_or_create(settings) {
            Ok(service) => service,
            Err(e) => {
                warn!(%e, "cannot create service");
                self.send(&Response::ClientInit(ClientInitResponse {
                    status: InitStatus::Fail,
                    version: String::new(),
                    errors: vec![e.to_string()],
                    meta: BTreeMap::new(),
                    metrics: BTreeMap::new(),
                }))?;
                return Ok(false);
            }
        };

        let telemetry = service.drain_telemetry();
        let response = ClientInitResponse {
            status: InitStatus::Ok,
            version: service.rules_version().unwrap_or_default(),
            errors: Vec::new(),
            meta: telemetry.span_meta().clone(),
            metrics: telemetry.span_metrics().clone(),
        };

        self.client_enabled = args.enabled;
        self.client_version = args.client_version;
        self.runtime_id = args.runtime_id;
        self.service = Some(service);
        self.send(&Response::ClientInit(response))?;
        Ok(true)
    }

    fn request_init(&mut self, args: RequestInitArgs) -> Result<bool, ProtocolError> {
        let Some(service) = self.service.clone() else {
            return Ok(false);
        };

        let features = service.features();
        let enabled = self
            .client_enabled
            .unwrap_or(features.asm == AsmStatus::Enabled);
        if !enabled {
            debug!("requests disabled, not opening a context");
            self.send(&Response::ConfigFeatures { enabled: false })?;
            return Ok(true);
        }

        let mut context = service.new_context();
        let result = match context.run(&args.data, None) {
            Ok(result) => result,
            Err(e) => return self.engine_error(&e),
        };
        self.context = Some(context);

        let mut verdict = verdict_from(&service, result);
        verdict.settings.insert(
            AUTO_USER_INSTRUM.to_string(),
            features.auto_user_instrum.as_str().to_string(),
        );
        self.send(&Response::RequestInit(verdict))?;
        Ok(true)
    }

    fn request_exec(&mut self, args: RequestExecArgs) -> Result<bool, ProtocolError> {
        let (Some(service), Some(context)) = (self.service.clone(), self.context.as_mut()) else {
            return Ok(false);
        };

        let result = match context.run(&args.data, args.rasp_rule.as_deref()) {
            Ok(result) => result,
            Err(e) => return self.engine_error(&e),
        };
        self.send(&Response::RequestExec(verdict_from(&service, result)))?;
        Ok(true)
    }

    fn request_shutdown(&mut self, args: RequestShutdownArgs) -> Result<bool, ProtocolError> {
        let (Some(service), Some(mut context)) = (self.service.clone(), self.context.take()) else {
            return Ok(false);
        };

        let mut data = args.data;
        if service.should_extract_schema(args.api_sec_samp_key) {
            if let Value::Object(map) = &mut data {
                trace!(key = args.api_sec_samp_key, "requesting schema extraction");
                map.insert(CONTEXT_PROCESSOR.to_string(), json!({EXTRACT_SCHEMA: true}));
            }
        }

        let result = match context.run(&data, None) {
            Ok(result) => result,
            Err(e) => return self.engine_error(&e),
        };
        let mut verdict = verdict_from(&service, result);
        let mut telemetry = MetricsCollector::new();
        context.metrics(&mut telemetry);
        telemetry.merge(service.drain_telemetry());
        verdict.meta.extend(telemetry.span_meta().clone());
        verdict.metrics.extend(telemetry.span_metrics().clone());
        self.send(&Response::RequestShutdown(verdict))?;
        Ok(true)
    }

    fn config_sync(&mut self, args: ConfigSyncArgs) -> Result<bool, ProtocolError> {
        let Some(service) = self.service.clone() else {
            return Ok(false);
        };

        let remote_config = RemoteConfigSettings::from_sync_path(&args.rem_cfg_path);
        let current = service.settings();
        if remote_config != current.remote_config || args.telemetry_settings != current.telemetry {
            let settings = ServiceSettings {
                engine: current.engine.clone(),
                remote_config,
                telemetry: args.telemetry_settings,
            };
            match self.cache.get_or_create(settings) {
                Ok(next) => {
                    debug!("rebound to service for new settings");
                    self.service = Some(next);
                }
                Err(e) => warn!(%e, "cannot rebind service, keeping the current one"),
            }
        } else {
            service.try_update();
        }

        let Some(service) = &self.service else {
            return Ok(false);
        };
        let enabled = self
            .client_enabled
            .unwrap_or(service.features().asm == AsmStatus::Enabled);
        let response = if enabled {
            Response::ConfigFeatures { enabled: true }
        } else {
            Response::ConfigSync {}
        };
        self.send(&response)?;
        Ok(true)
    }

    /// Report rejected request data and close; the request cannot go on.
    fn engine_error(&mut self, e: &EngineError) -> Result<bool, ProtocolError> {
        warn!(%e, state = self.state(), "engine rejected request data, closing connection");
        self.context = None;
        self.send(&Response::Error {})?;
        Ok(false)
    }
}

fn verdict_from(service: &Service, result: Option<EngineResult>) -> Verdict {
    let Some(result) = result else {
        return Verdict {
            actions: vec![VerdictAction {
                verdict: VerdictKind::Ok,
                parameters: BTreeMap::new(),
            }],
            ..Verdict::default()
        };
    };

    let mut actions: Vec<VerdictAction> = result
        .actions
        .into_iter()
        .map(|action| VerdictAction {
            verdict: match action.kind {
                ActionKind::Block => VerdictKind::Block,
                ActionKind::Redirect => VerdictKind::Redirect,
                ActionKind::StackTrace => VerdictKind::StackTrace,
                ActionKind::Record => VerdictKind::Record,
            },
            parameters: action.parameters,
        })
        .collect();

    let has_event_action = actions.iter().any(|a| {
        matches!(
            a.verdict,
            VerdictKind::Block | VerdictKind::Redirect | VerdictKind::Record
        )
    });
    if !has_event_action {
        actions.push(VerdictAction {
            verdict: VerdictKind::Record,
            parameters: BTreeMap::new(),
        });
    }

    Verdict {
        actions,
        triggers: result.triggers,
        force_keep: result.force_keep && service.allow_force_keep(),
        ..Verdict::default()
    }
}
