use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::action::{ActionType, ParsedAction};

/// Four-point risk classification driving the confirmation gate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

/// Outcome of validating one action. Computed per action, never persisted.
/// `allowed` and `requires_confirmation` are separate so the orchestrator can
/// distinguish hard blocks from soft gates.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SafetyValidation {
    pub allowed: bool,
    pub reason: Option<String>,
    pub requires_confirmation: bool,
    pub risk_level: RiskLevel,
}

impl SafetyValidation {
    fn blocked(reason: impl Into<String>, risk_level: RiskLevel) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
            requires_confirmation: false,
            risk_level,
        }
    }
}

/// Operator-tunable policy, read at construction and replaceable at runtime
/// via [`SafetyValidator::update_config`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SafetyConfig {
    pub confirm_destructive_actions: bool,
    pub max_actions_per_minute: u32,
    pub blocked_sites: Vec<String>,
    pub blocked_apps: Vec<String>,
    /// Phrases that force the confirmation gate regardless of risk level.
    pub require_confirmation_for: Vec<String>,
    /// Action types that skip confirmation when risk is below high.
    pub auto_confirm_types: Vec<ActionType>,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            confirm_destructive_actions: true,
            max_actions_per_minute: 60,
            blocked_sites: Vec::new(),
            blocked_apps: Vec::new(),
            require_confirmation_for: Vec::new(),
            auto_confirm_types: vec![ActionType::Click, ActionType::Scroll, ActionType::Wait],
        }
    }
}

/// Shell/SQL fragments that are never allowed through, confirmation or not.
const DANGEROUS_PATTERNS: &[&str] = &[
    "rm -rf",
    "rm -fr",
    "del /f",
    "del /s",
    "format c:",
    "mkfs",
    "dd if=",
    "drop table",
    "drop database",
    "truncate table",
    "delete from",
    ":(){ :|:& };:",
    "shutdown /s",
    "shutdown -h",
];

const HIGH_RISK_KEYWORDS: &[&str] = &[
    "payment",
    "purchase",
    "transfer",
    "credit card",
    "bank",
    "credential",
    "password",
    "login",
    "sign in",
];

const DESTRUCTIVE_KEYWORDS: &[&str] = &[
    "delete", "remove", "format", "wipe", "uninstall", "terminate", "kill",
];

const CREDENTIAL_FIELD_MARKERS: &[&str] = &["password", "credential", "passphrase", "pin code"];

const RATE_WINDOW: Duration = Duration::from_secs(60);
const LONG_TYPE_THRESHOLD: usize = 50;

/// Deterministic allow/block/confirm policy over parsed actions. The only
/// state is the sliding rate-limit window.
pub struct SafetyValidator {
    config: SafetyConfig,
    recent_actions: VecDeque<Instant>,
}

impl SafetyValidator {
    pub fn new(config: SafetyConfig) -> Self {
        Self {
            config,
            recent_actions: VecDeque::new(),
        }
    }

    pub fn config(&self) -> &SafetyConfig {
        &self.config
    }

    /// Swap the policy in place. Persistence of the new config is the
    /// caller's concern.
    pub fn update_config(&mut self, config: SafetyConfig) {
        self.config = config;
    }

    /// Clear the rate window.
    pub fn reset(&mut self) {
        self.recent_actions.clear();
    }

    /// Run the pipeline: rate limit, blocklists, risk classification,
    /// confirmation policy. Short-circuits on the first hard failure.
    pub fn validate_action(&mut self, action: &ParsedAction) -> SafetyValidation {
        if !self.within_rate_limit() {
            warn!(
                limit = self.config.max_actions_per_minute,
                "action rate limit exceeded"
            );
            return SafetyValidation::blocked(
                format!(
                    "rate limit exceeded: more than {} actions per minute",
                    self.config.max_actions_per_minute
                ),
                RiskLevel::Medium,
            );
        }

        let text = self.action_text(action);

        if let Some(reason) = self.blocklist_reason(action, &text) {
            warn!(action = action.action_type.as_str(), %reason, "action blocked");
            return SafetyValidation::blocked(reason, RiskLevel::Critical);
        }

        let risk_level = Self::classify_risk(action, &text);
        let requires_confirmation = self.needs_confirmation(action, &text, risk_level);

        SafetyValidation {
            allowed: true,
            reason: None,
            requires_confirmation,
            risk_level,
        }
    }

    /// Sliding 60-second window. Records the current action; the one that
    /// tips the window over the cap is the one rejected.
    fn within_rate_limit(&mut self) -> bool {
        let now = Instant::now();
        while let Some(front) = self.recent_actions.front() {
            if now.duration_since(*front) > RATE_WINDOW {
                self.recent_actions.pop_front();
            } else {
                break;
            }
        }
        if self.recent_actions.len() >= self.config.max_actions_per_minute as usize {
            return false;
        }
        self.recent_actions.push_back(now);
        true
    }

    /// All searchable text of an action, lowercased: description, target,
    /// and the url/app/text params.
    fn action_text(&self, action: &ParsedAction) -> String {
        let mut text = action.description.to_lowercase();
        if let Some(target) = &action.target {
            text.push(' ');
            text.push_str(&target.to_lowercase());
        }
        for key in ["url", "app", "text"] {
            if let Some(v) = action.param_str(key) {
                text.push(' ');
                text.push_str(&v.to_lowercase());
            }
        }
        text
    }

    fn blocklist_reason(&self, action: &ParsedAction, text: &str) -> Option<String> {
        for site in &self.config.blocked_sites {
            if !site.is_empty() && text.contains(&site.to_lowercase()) {
                return Some(format!("blocked site: {}", site));
            }
        }
        for app in &self.config.blocked_apps {
            if !app.is_empty() && text.contains(&app.to_lowercase()) {
                return Some(format!("blocked application: {}", app));
            }
        }
        if let Some(pattern) = DANGEROUS_PATTERNS.iter().find(|p| text.contains(*p)) {
            return Some(format!("dangerous pattern: {}", pattern));
        }
        // Automated credential entry is never permitted, even with
        // confirmation.
        if action.action_type == ActionType::Type {
            let field = action.target.as_deref().unwrap_or("").to_lowercase();
            if CREDENTIAL_FIELD_MARKERS.iter().any(|m| field.contains(m)) {
                return Some("typing into a credential field is not permitted".to_string());
            }
        }
        None
    }

    fn classify_risk(action: &ParsedAction, text: &str) -> RiskLevel {
        if DANGEROUS_PATTERNS.iter().any(|p| text.contains(p)) {
            return RiskLevel::Critical;
        }
        if HIGH_RISK_KEYWORDS.iter().any(|k| text.contains(k)) {
            return RiskLevel::High;
        }
        let long_type = action.action_type == ActionType::Type
            && action
                .param_str("text")
                .map(|t| t.chars().count() > LONG_TYPE_THRESHOLD)
                .unwrap_or(false);
        if DESTRUCTIVE_KEYWORDS.iter().any(|k| text.contains(k))
            || action.action_type == ActionType::Navigate
            || long_type
        {
            return RiskLevel::Medium;
        }
        RiskLevel::Low
    }

    /// High/critical risk always gates, taking precedence over the
    /// auto-confirm allowlist; below that the allowlist wins, then configured
    /// trigger phrases, then the destructive-actions setting for medium risk.
    fn needs_confirmation(&self, action: &ParsedAction, text: &str, risk: RiskLevel) -> bool {
        if risk >= RiskLevel::High {
            return true;
        }
        if self.config.auto_confirm_types.contains(&action.action_type) {
            return false;
        }
        if self
            .config
            .require_confirmation_for
            .iter()
            .any(|phrase| !phrase.is_empty() && text.contains(&phrase.to_lowercase()))
        {
            return true;
        }
        risk == RiskLevel::Medium && self.config.confirm_destructive_actions
    }
}

impl Default for SafetyValidator {
    fn default() -> Self {
        Self::new(SafetyConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Map, Value};

    fn action(action_type: ActionType, description: &str) -> ParsedAction {
        ParsedAction {
            action_type,
            description: description.to_string(),
            target: None,
            coordinates: None,
            params: Map::new(),
            confidence: 0.9,
        }
    }

    fn type_action(text: &str, target: Option<&str>) -> ParsedAction {
        let mut a = action(ActionType::Type, "type into field");
        a.target = target.map(|t| t.to_string());
        a.params.insert("text".into(), Value::String(text.to_string()));
        a
    }

    #[test]
    fn destructive_description_respects_confirm_setting() {
        let a = action(ActionType::Press, "delete the selected file");

        let mut on = SafetyValidator::default();
        let v = on.validate_action(&a);
        assert!(v.allowed);
        assert_eq!(v.risk_level, RiskLevel::Medium);
        assert!(v.requires_confirmation);

        let mut off = SafetyValidator::new(SafetyConfig {
            confirm_destructive_actions: false,
            ..SafetyConfig::default()
        });
        let v = off.validate_action(&a);
        assert_eq!(v.risk_level, RiskLevel::Medium);
        assert!(!v.requires_confirmation);
    }

    #[test]
    fn rate_limit_rejects_the_sixty_first() {
        let mut validator = SafetyValidator::default();
        let a = action(ActionType::Press, "press tab");
        for i in 0..60 {
            assert!(validator.validate_action(&a).allowed, "action {i}");
        }
        let v = validator.validate_action(&a);
        assert!(!v.allowed);
        assert_eq!(v.risk_level, RiskLevel::Medium);

        validator.reset();
        assert!(validator.validate_action(&a).allowed);
    }

    #[test]
    fn dangerous_patterns_are_hard_blocked() {
        let mut validator = SafetyValidator::default();
        let a = type_action("rm -rf /home/user", None);
        let v = validator.validate_action(&a);
        assert!(!v.allowed);
        assert_eq!(v.risk_level, RiskLevel::Critical);

        let sql = action(ActionType::Press, "run DROP TABLE users");
        assert!(!validator.validate_action(&sql).allowed);
    }

    #[test]
    fn credential_entry_is_never_permitted() {
        let mut validator = SafetyValidator::default();
        let a = type_action("hunter2", Some("Password input"));
        let v = validator.validate_action(&a);
        assert!(!v.allowed);
        assert!(v.reason.unwrap().contains("credential"));
    }

    #[test]
    fn blocked_sites_and_apps() {
        let mut validator = SafetyValidator::new(SafetyConfig {
            blocked_sites: vec!["badsite.example".to_string()],
            blocked_apps: vec!["regedit".to_string()],
            ..SafetyConfig::default()
        });

        let mut nav = action(ActionType::Navigate, "open page");
        nav.params.insert("url".into(), Value::String("https://badsite.example/x".into()));
        assert!(!validator.validate_action(&nav).allowed);

        let app = action(ActionType::Navigate, "launch Regedit");
        assert!(!validator.validate_action(&app).allowed);
    }

    #[test]
    fn high_risk_keywords_always_gate() {
        let mut validator = SafetyValidator::default();
        // Click is on the auto-confirm allowlist, but high risk overrides it.
        let a = action(ActionType::Click, "click the confirm payment button");
        let v = validator.validate_action(&a);
        assert!(v.allowed);
        assert_eq!(v.risk_level, RiskLevel::High);
        assert!(v.requires_confirmation);
    }

    #[test]
    fn auto_confirm_types_skip_the_gate() {
        let mut validator = SafetyValidator::default();
        let v = validator.validate_action(&action(ActionType::Click, "click next"));
        assert_eq!(v.risk_level, RiskLevel::Low);
        assert!(!v.requires_confirmation);
    }

    #[test]
    fn navigate_and_long_type_are_medium() {
        let mut validator = SafetyValidator::default();
        let nav = action(ActionType::Navigate, "open the settings page");
        assert_eq!(validator.validate_action(&nav).risk_level, RiskLevel::Medium);

        let long = type_action(&"x".repeat(51), None);
        assert_eq!(validator.validate_action(&long).risk_level, RiskLevel::Medium);

        let short = type_action("hello", None);
        assert_eq!(validator.validate_action(&short).risk_level, RiskLevel::Low);
    }

    #[test]
    fn confirmation_trigger_phrases() {
        let mut validator = SafetyValidator::new(SafetyConfig {
            require_confirmation_for: vec!["send email".to_string()],
            ..SafetyConfig::default()
        });
        let a = action(ActionType::Press, "send email to the whole team");
        let v = validator.validate_action(&a);
        assert_eq!(v.risk_level, RiskLevel::Low);
        assert!(v.requires_confirmation);
    }
}
