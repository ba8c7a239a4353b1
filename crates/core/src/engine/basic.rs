//! Reference engine.
//!
//! Evaluates simple address conditions (`equals`, `contains`, `in_data`) so
//! the helper runs end to end without an external engine. Rule sections
//! follow the ruleset layout produced by the remote-config aggregators.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

use super::{
    Action, ActionKind, CONTEXT_PROCESSOR, EXTRACT_SCHEMA, Engine, EngineContext, EngineFactory,
    EngineResult, Ruleset, UpdateOutcome, section,
};
use crate::error::EngineError;
use crate::settings::EngineSettings;
use crate::telemetry::{RULES_MATCHED, SCHEMA_PREFIX, TelemetrySubmitter, WAF_TIMEOUTS};

const BUNDLED_RULES: &str = r#"{
  "version": "1.0.0",
  "rules": [
    {
      "id": "blk-001-001",
      "name": "Block IP addresses",
      "tags": {"type": "block_ip", "category": "security_response"},
      "conditions": [{"address": "http.client_ip", "in_data": "blocked_ips"}],
      "on_match": ["block"]
    },
    {
      "id": "blk-001-002",
      "name": "Block user IDs",
      "tags": {"type": "block_user", "category": "security_response"},
      "conditions": [{"address": "usr.id", "in_data": "blocked_users"}],
      "on_match": ["block"]
    },
    {
      "id": "ua0-600-55x",
      "name": "Security scanner user agent",
      "tags": {"type": "attack_tool", "category": "attack_attempt"},
      "conditions": [{"address": "server.request.headers.user-agent", "contains": "sqlmap"}]
    }
  ]
}"#;

const DEFAULT_BLOCK_STATUS: &str = "403";

#[derive(Debug, Clone, Deserialize)]
struct Rule {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    tags: BTreeMap<String, String>,
    conditions: Vec<Condition>,
    #[serde(default)]
    on_match: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct Condition {
    address: String,
    #[serde(default)]
    equals: Option<String>,
    #[serde(default)]
    contains: Option<String>,
    #[serde(default)]
    in_data: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct Target {
    #[serde(default)]
    rule_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct RuleOverride {
    rules_target: Vec<Target>,
    #[serde(default)]
    enabled: Option<bool>,
    #[serde(default)]
    on_match: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
struct Exclusion {
    #[serde(default)]
    rules_target: Vec<Target>,
}

#[derive(Debug, Clone, Deserialize)]
struct ActionDef {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    parameters: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Deserialize)]
struct DataEntry {
    value: String,
    #[serde(default)]
    expiration: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
struct RuleData {
    id: String,
    data: Vec<DataEntry>,
}

#[derive(Debug, Clone, Deserialize)]
struct RulesFile {
    #[serde(default)]
    version: Option<String>,
    rules: Vec<Rule>,
    #[serde(default)]
    actions: Vec<ActionDef>,
}

/// Rules as currently committed, rebuilt wholesale on every update.
#[derive(Debug, Clone, Default)]
struct RuleState {
    version: Option<String>,
    rules: Vec<Rule>,
    custom_rules: Vec<Rule>,
    overrides: Vec<RuleOverride>,
    excluded: HashSet<String>,
    actions: HashMap<String, ActionDef>,
    data: HashMap<String, HashMap<String, Option<u64>>>,
}

impl RuleState {
    /// Rules after exclusions and overrides, with their effective `on_match`.
    fn effective_rules(&self) -> Vec<(&Rule, Vec<String>)> {
        self.rules
            .iter()
            .chain(&self.custom_rules)
            .filter(|rule| !self.excluded.contains(&rule.id))
            .filter_map(|rule| {
                let mut enabled = true;
                let mut on_match = rule.on_match.clone();
                for ovrd in &self.overrides {
                    let targeted = ovrd
                        .rules_target
                        .iter()
                        .any(|t| t.rule_id.as_deref() == Some(rule.id.as_str()));
                    if !targeted {
                        continue;
                    }
                    if let Some(e) = ovrd.enabled {
                        enabled = e;
                    }
                    if let Some(ref m) = ovrd.on_match {
                        on_match.clone_from(m);
                    }
                }
                enabled.then_some((rule, on_match))
            })
            .collect()
    }

    fn in_data(&self, data_id: &str, value: &str, now: u64) -> bool {
        self.data
            .get(data_id)
            .and_then(|entries| entries.get(value))
            .is_some_and(|exp| exp.is_none_or(|e| e > now))
    }

    fn resolve_action(&self, id: &str) -> Action {
        let Some(def) = self.actions.get(id) else {
            return if id == "block" {
                Action {
                    kind: ActionKind::Block,
                    parameters: BTreeMap::from([
                        ("status_code".to_string(), DEFAULT_BLOCK_STATUS.to_string()),
                        ("type".to_string(), "auto".to_string()),
                    ]),
                }
            } else {
                Action::record()
            };
        };

        let kind = match def.kind.as_str() {
            "block_request" => ActionKind::Block,
            "redirect_request" => ActionKind::Redirect,
            "generate_stack" => ActionKind::StackTrace,
            _ => ActionKind::Record,
        };
        let parameters = def
            .parameters
            .iter()
            .map(|(k, v)| {
                let v = v.as_str().map_or_else(|| v.to_string(), str::to_string);
                (k.clone(), v)
            })
            .collect();
        Action { kind, parameters }
    }
}

fn parse_section<T: for<'de> Deserialize<'de>>(name: &str, value: &Value) -> Result<T, EngineError> {
    T::deserialize(value).map_err(|e| EngineError::UpdateRejected(format!("{name}: {e}")))
}

/// Type skeleton of a value: scalars become `[type]`, maps keep their keys
/// and arrays describe their first element plus the length.
fn schema_of(value: &Value) -> Value {
    match value {
        Value::Null => json!([1]),
        Value::Bool(_) => json!([2]),
        Value::Number(n) if n.is_f64() => json!([16]),
        Value::Number(_) => json!([4]),
        Value::String(_) => json!([8]),
        Value::Array(items) => {
            let first = items.first().map_or_else(|| json!([]), |v| json!([schema_of(v)]));
            json!([first, {"len": items.len()}])
        }
        Value::Object(map) => {
            let fields: serde_json::Map<String, Value> = map
                .iter()
                .map(|(k, v)| (k.clone(), schema_of(v)))
                .collect();
            json!([fields])
        }
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

pub struct BasicEngine {
    baseline: RulesFile,
    state: RwLock<Arc<RuleState>>,
    timeout: Option<Duration>,
}

impl BasicEngine {
    /// Build from a rules document.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is not a valid rules file.
    pub fn from_json(rules: &str) -> Result<Self, EngineError> {
        let baseline: RulesFile =
            serde_json::from_str(rules).map_err(|e| EngineError::InvalidRuleset(e.to_string()))?;
        let state = RuleState {
            version: baseline.version.clone(),
            rules: baseline.rules.clone(),
            actions: baseline
                .actions
                .iter()
                .map(|a| (a.id.clone(), a.clone()))
                .collect(),
            ..RuleState::default()
        };
        Ok(Self {
            baseline,
            state: RwLock::new(Arc::new(state)),
            timeout: None,
        })
    }

    /// Cap the time one `run()` may spend evaluating rules.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Engine with the bundled baseline rules.
    ///
    /// # Errors
    ///
    /// Never fails in practice; the bundled rules are static.
    pub fn bundled() -> Result<Self, EngineError> {
        Self::from_json(BUNDLED_RULES)
    }

    fn current(&self) -> Arc<RuleState> {
        Arc::clone(&self.state.read().unwrap_or_else(PoisonError::into_inner))
    }
}

impl Engine for BasicEngine {
    fn update(&self, ruleset: &Ruleset) -> Result<UpdateOutcome, EngineError> {
        let mut next = (*self.current()).clone();

        if let Some(rules) = ruleset.get(section::RULES) {
            if rules.is_null() {
                next.rules.clone_from(&self.baseline.rules);
                next.version.clone_from(&self.baseline.version);
            } else {
                next.rules = parse_section(section::RULES, rules)?;
                next.version = ruleset
                    .get(section::VERSION)
                    .and_then(Value::as_str)
                    .map(str::to_string);
            }
        }
        if let Some(v) = ruleset.get(section::RULES_OVERRIDE) {
            next.overrides = parse_section(section::RULES_OVERRIDE, v)?;
        }
        if let Some(v) = ruleset.get(section::EXCLUSIONS) {
            let exclusions: Vec<Exclusion> = parse_section(section::EXCLUSIONS, v)?;
            next.excluded = exclusions
                .into_iter()
                .flat_map(|e| e.rules_target)
                .filter_map(|t| t.rule_id)
                .collect();
        }
        if let Some(v) = ruleset.get(section::CUSTOM_RULES) {
            next.custom_rules = parse_section(section::CUSTOM_RULES, v)?;
        }
        if let Some(v) = ruleset.get(section::ACTIONS) {
            let defs: Vec<ActionDef> = parse_section(section::ACTIONS, v)?;
            next.actions = self
                .baseline
                .actions
                .iter()
                .chain(&defs)
                .map(|a| (a.id.clone(), a.clone()))
                .collect();
        }
        if let Some(v) = ruleset.get(section::RULES_DATA) {
            let data: Vec<RuleData> = parse_section(section::RULES_DATA, v)?;
            next.data = data
                .into_iter()
                .map(|d| {
                    let entries = d.data.into_iter().map(|e| (e.value, e.expiration)).collect();
                    (d.id, entries)
                })
                .collect();
        }

        let outcome = UpdateOutcome {
            rules_loaded: u32::try_from(next.rules.len() + next.custom_rules.len())
                .unwrap_or(u32::MAX),
            rules_failed: 0,
            version: next.version.clone(),
        };
        debug!(
            rules = outcome.rules_loaded,
            version = ?outcome.version,
            "reference engine updated"
        );

        *self.state.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(next);
        Ok(outcome)
    }

    fn new_context(&self) -> Box<dyn EngineContext> {
        Box::new(BasicContext {
            state: self.current(),
            inputs: serde_json::Map::new(),
            matched: HashSet::new(),
            budget: self.timeout,
            timeouts: 0,
            schemas: BTreeMap::new(),
        })
    }

    fn rules_version(&self) -> Option<String> {
        self.current().version.clone()
    }
}

struct BasicContext {
    state: Arc<RuleState>,
    inputs: serde_json::Map<String, Value>,
    matched: HashSet<String>,
    budget: Option<Duration>,
    timeouts: u32,
    schemas: BTreeMap<String, String>,
}

impl BasicContext {
    fn extract_schemas(&mut self) {
        for (address, value) in &self.inputs {
            if address.starts_with("server.") {
                self.schemas
                    .insert(format!("{SCHEMA_PREFIX}{address}"), schema_of(value).to_string());
            }
        }
    }

    fn condition_match(&self, cond: &Condition, now: u64) -> Option<String> {
        let value = self.inputs.get(&cond.address)?;
        let candidates: Vec<&str> = match value {
            Value::String(s) => vec![s.as_str()],
            Value::Array(items) => items.iter().filter_map(Value::as_str).collect(),
            _ => Vec::new(),
        };

        candidates
            .into_iter()
            .find(|candidate| {
                cond.equals.as_deref().is_none_or(|e| *candidate == e)
                    && cond.contains.as_deref().is_none_or(|c| candidate.contains(c))
                    && cond
                        .in_data
                        .as_deref()
                        .is_none_or(|id| self.state.in_data(id, candidate, now))
            })
            .map(str::to_string)
    }
}

impl EngineContext for BasicContext {
    fn run(
        &mut self,
        data: &Value,
        rasp_rule: Option<&str>,
    ) -> Result<Option<EngineResult>, EngineError> {
        let Value::Object(map) = data else {
            return Err(EngineError::InvalidInput("data must be a map".into()));
        };
        self.inputs
            .extend(map.iter().map(|(k, v)| (k.clone(), v.clone())));

        let extract = map
            .get(CONTEXT_PROCESSOR)
            .and_then(|p| p.get(EXTRACT_SCHEMA))
            .and_then(Value::as_bool)
            == Some(true);
        if extract {
            self.extract_schemas();
        }

        let started = Instant::now();
        let now = now_secs();
        let mut result = EngineResult::default();
        let mut newly_matched = Vec::new();

        for (rule, on_match) in self.state.effective_rules() {
            if self.budget.is_some_and(|budget| started.elapsed() >= budget) {
                warn!(rule = %rule.id, "rule evaluation ran out of time");
                self.timeouts += 1;
                break;
            }
            if self.matched.contains(&rule.id) {
                continue;
            }
            if let Some(rasp) = rasp_rule {
                if rule.tags.get("rasp_rule").map(String::as_str) != Some(rasp) {
                    continue;
                }
            }

            let mut matches = Vec::with_capacity(rule.conditions.len());
            for cond in &rule.conditions {
                match self.condition_match(cond, now) {
                    Some(value) => matches.push(json!({"address": cond.address, "value": value})),
                    None => break,
                }
            }
            if matches.len() != rule.conditions.len() {
                continue;
            }

            debug!(rule = %rule.id, "rule matched");
            newly_matched.push(rule.id.clone());
            result.triggers.push(json!({
                "rule": {"id": rule.id, "name": rule.name, "tags": rule.tags},
                "rule_matches": matches,
            }));
            if on_match.is_empty() {
                result.actions.push(Action::record());
            }
            for id in &on_match {
                let action = self.state.resolve_action(id);
                if !result.actions.contains(&action) {
                    result.actions.push(action);
                }
            }
        }

        if newly_matched.is_empty() {
            return Ok(None);
        }
        self.matched.extend(newly_matched);
        result.force_keep = true;
        Ok(Some(result))
    }

    fn metrics(&self, submitter: &mut dyn TelemetrySubmitter) {
        #[allow(clippy::cast_precision_loss)]
        submitter.submit_span_metric(RULES_MATCHED, self.matched.len() as f64);
        if self.timeouts > 0 {
            submitter.submit_span_metric(WAF_TIMEOUTS, f64::from(self.timeouts));
        }
        for (key, schema) in &self.schemas {
            submitter.submit_span_meta(key, schema.clone());
        }
    }
}

/// Builds [`BasicEngine`]s from the declared rules file.
#[derive(Debug, Default)]
pub struct BasicEngineFactory;

impl EngineFactory for BasicEngineFactory {
    fn build(&self, settings: &EngineSettings) -> Result<Arc<dyn Engine>, EngineError> {
        let engine = match &settings.rules_file {
            Some(path) => {
                let rules = std::fs::read_to_string(path).map_err(|source| {
                    warn!(path, %source, "cannot read rules file");
                    EngineError::RulesFile {
                        path: path.clone(),
                        source,
                    }
                })?;
                BasicEngine::from_json(&rules)?
            }
            None => BasicEngine::bundled()?,
        };
        let timeout = settings.timeout_us.map(Duration::from_micros);
        Ok(Arc::new(engine.with_timeout(timeout)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::MetricsCollector;

    fn ruleset(value: Value) -> Ruleset {
        match value {
            Value::Object(map) => Ruleset::from(map),
            _ => panic!("ruleset must be an object"),
        }
    }

    #[test]
    fn bundled_rules_load() {
        let engine = BasicEngine::bundled().unwrap();
        assert_eq!(engine.rules_version().as_deref(), Some("1.0.0"));
    }

    #[test]
    fn clean_request_has_no_result() {
        let engine = BasicEngine::bundled().unwrap();
        let mut ctx = engine.new_context();
        let res = ctx
            .run(&json!({"server.request.headers.user-agent": "curl/8.0"}), None)
            .unwrap();
        assert!(res.is_none());
    }

    #[test]
    fn scanner_user_agent_is_recorded_once() {
        let engine = BasicEngine::bundled().unwrap();
        let mut ctx = engine.new_context();
        let data = json!({"server.request.headers.user-agent": "sqlmap/1.7"});

        let res = ctx.run(&data, None).unwrap().unwrap();
        assert_eq!(res.actions, vec![Action::record()]);
        assert_eq!(res.triggers.len(), 1);
        assert!(res.force_keep);

        assert!(ctx.run(&data, None).unwrap().is_none());

        let mut collector = MetricsCollector::new();
        ctx.metrics(&mut collector);
        assert!((collector.span_metrics()[RULES_MATCHED] - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn rules_data_blocks_ip_until_expiration() {
        let engine = BasicEngine::bundled().unwrap();
        engine
            .update(&ruleset(json!({
                "rules_data": [{
                    "id": "blocked_ips",
                    "type": "ip_with_expiration",
                    "data": [
                        {"value": "1.2.3.4"},
                        {"value": "5.6.7.8", "expiration": 1}
                    ]
                }]
            })))
            .unwrap();

        let mut ctx = engine.new_context();
        let res = ctx.run(&json!({"http.client_ip": "1.2.3.4"}), None).unwrap().unwrap();
        assert_eq!(res.actions[0].kind, ActionKind::Block);
        assert_eq!(res.actions[0].parameters["status_code"], "403");

        let mut ctx = engine.new_context();
        assert!(ctx.run(&json!({"http.client_ip": "5.6.7.8"}), None).unwrap().is_none());
    }

    #[test]
    fn override_disables_rule_and_exclusion_removes_it() {
        let engine = BasicEngine::bundled().unwrap();
        let data = json!({"server.request.headers.user-agent": "sqlmap"});

        engine
            .update(&ruleset(json!({
                "rules_override": [{"rules_target": [{"rule_id": "ua0-600-55x"}], "enabled": false}]
            })))
            .unwrap();
        assert!(engine.new_context().run(&data, None).unwrap().is_none());

        engine
            .update(&ruleset(json!({
                "rules_override": [],
                "exclusions": [{"id": "e1", "rules_target": [{"rule_id": "ua0-600-55x"}]}]
            })))
            .unwrap();
        assert!(engine.new_context().run(&data, None).unwrap().is_none());

        engine.update(&ruleset(json!({"exclusions": []}))).unwrap();
        assert!(engine.new_context().run(&data, None).unwrap().is_some());
    }

    #[test]
    fn custom_action_definitions_apply() {
        let engine = BasicEngine::bundled().unwrap();
        engine
            .update(&ruleset(json!({
                "custom_rules": [{
                    "id": "custom-1",
                    "conditions": [{"address": "server.request.uri.raw", "contains": "/admin"}],
                    "on_match": ["go_away"]
                }],
                "actions": [{
                    "id": "go_away",
                    "type": "redirect_request",
                    "parameters": {"location": "https://example.com", "status_code": 303}
                }]
            })))
            .unwrap();

        let mut ctx = engine.new_context();
        let res = ctx
            .run(&json!({"server.request.uri.raw": "/admin/login"}), None)
            .unwrap()
            .unwrap();
        assert_eq!(res.actions[0].kind, ActionKind::Redirect);
        assert_eq!(res.actions[0].parameters["status_code"], "303");
        assert_eq!(res.actions[0].parameters["location"], "https://example.com");
    }

    #[test]
    fn null_rules_restore_baseline() {
        let engine = BasicEngine::bundled().unwrap();
        engine
            .update(&ruleset(json!({"version": "2.0.0", "rules": []})))
            .unwrap();
        assert_eq!(engine.rules_version().as_deref(), Some("2.0.0"));

        let outcome = engine.update(&ruleset(json!({"rules": null}))).unwrap();
        assert_eq!(outcome.rules_loaded, 3);
        assert_eq!(engine.rules_version().as_deref(), Some("1.0.0"));
    }

    #[test]
    fn exhausted_budget_stops_evaluation() {
        let engine = BasicEngine::bundled()
            .unwrap()
            .with_timeout(Some(Duration::ZERO));
        let mut ctx = engine.new_context();
        let data = json!({"server.request.headers.user-agent": "sqlmap/1.7"});
        assert!(ctx.run(&data, None).unwrap().is_none());

        let mut collector = MetricsCollector::new();
        ctx.metrics(&mut collector);
        assert!((collector.span_metrics()[WAF_TIMEOUTS] - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn schemas_are_extracted_on_request() {
        let engine = BasicEngine::bundled().unwrap();
        let mut ctx = engine.new_context();
        ctx.run(
            &json!({
                "server.request.query": {"id": ["7"], "debug": true},
                "http.client_ip": "10.0.0.1"
            }),
            None,
        )
        .unwrap();

        let mut collector = MetricsCollector::new();
        ctx.metrics(&mut collector);
        assert!(collector.span_meta().is_empty());

        ctx.run(
            &json!({
                "server.response.status": "200",
                CONTEXT_PROCESSOR: {EXTRACT_SCHEMA: true}
            }),
            None,
        )
        .unwrap();
        let mut collector = MetricsCollector::new();
        ctx.metrics(&mut collector);
        let meta = collector.span_meta();
        assert_eq!(meta.len(), 2);
        let query: Value =
            serde_json::from_str(&meta["_dd.appsec.s.server.request.query"]).unwrap();
        assert_eq!(query, json!([{"debug": [2], "id": [[[8]], {"len": 1}]}]));
        assert_eq!(meta["_dd.appsec.s.server.response.status"], "[8]");
    }

    #[test]
    fn factory_applies_timeout_setting() {
        let settings = EngineSettings {
            timeout_us: Some(250),
            ..EngineSettings::default()
        };
        assert!(BasicEngineFactory.build(&settings).is_ok());
        let engine = BasicEngine::bundled()
            .unwrap()
            .with_timeout(settings.timeout_us.map(Duration::from_micros));
        assert_eq!(engine.timeout, Some(Duration::from_micros(250)));
    }

    #[test]
    fn invalid_section_keeps_previous_state() {
        let engine = BasicEngine::bundled().unwrap();
        let err = engine.update(&ruleset(json!({"rules": [{"id": 5}]})));
        assert!(matches!(err, Err(EngineError::UpdateRejected(_))));
        assert_eq!(engine.rules_version().as_deref(), Some("1.0.0"));
    }

    #[test]
    fn non_map_input_is_rejected() {
        let engine = BasicEngine::bundled().unwrap();
        let mut ctx = engine.new_context();
        assert!(ctx.run(&json!([1, 2]), None).is_err());
    }

    #[test]
    fn factory_reports_missing_rules_file() {
        let settings = EngineSettings {
            rules_file: Some("/nonexistent/rules.json".into()),
            ..EngineSettings::default()
        };
        let err = BasicEngineFactory.build(&settings).err().unwrap();
        assert!(matches!(err, EngineError::RulesFile { .. }));
    }

    #[test]
    fn factory_reads_rules_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.json");
        std::fs::write(&path, r#"{"version": "9.9", "rules": []}"#).unwrap();
        let settings = EngineSettings {
            rules_file: Some(path.to_string_lossy().into_owned()),
            ..EngineSettings::default()
        };
        let engine = BasicEngineFactory.build(&settings).unwrap();
        assert_eq!(engine.rules_version().as_deref(), Some("9.9"));
    }
}
