// ===============================
// src/environment.rs
// ===============================
//
// Environment Manager:
// - named profiles (testnet / mainnet), each with credentials, endpoints and ceilings
// - validation before activation (credential shape, https/wss endpoints)
// - atomic switch: the target is fully built before the active one is replaced
// - composes the gateway stack: live | paper, optionally wrapped by the safety policy
//
use ahash::AHashMap as HashMap;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::Duration;
use tracing::{info, warn};
use url::Url;

use crate::client::{ClientConfig, ExchangeClient};
use crate::domain::{ListingEvent, Position};
use crate::error::{ConfigError, EntryError};
use crate::feed::Venue;
use crate::gateway::{LiveGateway, OrderGateway};
use crate::metrics::CONFIG_ENVIRONMENT;
use crate::paper::PaperGateway;
use crate::recorder::AuditRecord;
use crate::risk::RiskLimits;
use crate::safety::{SafeGateway, SafetyLimits, SafetyPolicy};

pub const DEFAULT_MIN_CREDENTIAL_LEN: usize = 64;

#[derive(Debug, Clone)]
pub struct EnvironmentProfile {
    pub name: String,
    pub is_real_money: bool,
    pub rest_url: String,
    pub stream_url: String,
    pub api_key: String,
    pub api_secret: String,
    pub max_positions: usize,
    pub max_order_size: f64,
    pub min_credential_len: usize,
    /// Required on real-money profiles.
    pub safety: Option<SafetyLimits>,
}

fn require_scheme(profile: &str, field: &'static str, url: &str, scheme: &'static str) -> Result<(), ConfigError> {
    match Url::parse(url) {
        Ok(u) if u.scheme() == scheme && u.host_str().is_some() => Ok(()),
        _ => Err(ConfigError::InsecureEndpoint { profile: profile.to_string(), field, scheme, url: url.to_string() }),
    }
}

fn require_credential(profile: &str, field: &'static str, value: &str, min: usize) -> Result<(), ConfigError> {
    let v = value.trim();
    if v.is_empty() {
        return Err(ConfigError::MissingCredential { profile: profile.to_string(), field });
    }
    if v.len() < min {
        return Err(ConfigError::CredentialTooShort { profile: profile.to_string(), field, min });
    }
    Ok(())
}

fn positive(v: f64) -> bool { v.is_finite() && v > 0.0 }

impl EnvironmentProfile {
    /// Credentials are only required when orders go to the exchange.
    pub fn validate(&self, simulate: bool) -> Result<(), ConfigError> {
        let name = self.name.as_str();
        require_scheme(name, "rest_url", &self.rest_url, "https")?;
        require_scheme(name, "stream_url", &self.stream_url, "wss")?;
        if !simulate {
            require_credential(name, "api_key", &self.api_key, self.min_credential_len)?;
            require_credential(name, "api_secret", &self.api_secret, self.min_credential_len)?;
        }
        if self.max_positions == 0 || !positive(self.max_order_size) {
            return Err(ConfigError::Invalid {
                profile: name.to_string(),
                reason: "max_positions and max_order_size must be positive".into(),
            });
        }
        if self.is_real_money {
            let Some(s) = &self.safety else {
                return Err(ConfigError::Invalid { profile: name.to_string(), reason: "real-money profile without safety limits".into() });
            };
            if !positive(s.max_order_notional) || !positive(s.daily_loss_limit) {
                return Err(ConfigError::Invalid {
                    profile: name.to_string(),
                    reason: "max order notional and daily loss limit must be positive".into(),
                });
            }
        }
        Ok(())
    }
}

/// Shared, profile-independent construction settings.
#[derive(Clone)]
pub struct EnvironmentSettings {
    /// Timeouts, retries and weight window; URL and keys come from the profile.
    pub client: ClientConfig,
    pub filter_cache_ttl: Duration,
    pub simulate: bool,
    pub paper_balance: f64,
    pub quote_asset: String,
    pub min_volume_24h: f64,
    pub risk: RiskLimits,
    pub audit: Option<mpsc::Sender<AuditRecord>>,
}

/// Everything bound to the active profile.
#[derive(Clone)]
pub struct ActiveEnvironment {
    pub profile: EnvironmentProfile,
    pub client: Arc<ExchangeClient>,
    pub gateway: Arc<dyn OrderGateway>,
    pub policy: Option<Arc<SafetyPolicy>>,
}

impl ActiveEnvironment {
    pub fn venue(&self) -> Venue {
        Venue {
            profile: self.profile.name.clone(),
            stream_url: self.profile.stream_url.clone(),
            source: self.client.clone(),
        }
    }
}

pub struct EnvironmentManager {
    profiles: HashMap<String, EnvironmentProfile>,
    // one per real-money profile for the whole run: loss history outlives switches
    policies: HashMap<String, Arc<SafetyPolicy>>,
    settings: EnvironmentSettings,
    active: ActiveEnvironment,
    venue_tx: watch::Sender<Venue>,
}

impl EnvironmentManager {
    /// Activate `initial`. Failure here is a startup failure.
    pub fn new(
        profiles: Vec<EnvironmentProfile>,
        settings: EnvironmentSettings,
        initial: &str,
    ) -> Result<(Self, watch::Receiver<Venue>), ConfigError> {
        let profiles: HashMap<String, EnvironmentProfile> = profiles.into_iter().map(|p| (p.name.clone(), p)).collect();
        let policies: HashMap<String, Arc<SafetyPolicy>> = profiles
            .values()
            .filter_map(|p| {
                let limits = p.safety.clone()?;
                Some((p.name.clone(), Arc::new(SafetyPolicy::new(&p.name, limits, settings.audit.clone()))))
            })
            .collect();
        let active = build(&profiles, &policies, &settings, initial)?;
        let (venue_tx, venue_rx) = watch::channel(active.venue());
        publish_gauge(None, &active.profile.name);
        info!(environment = %active.profile.name, real_money = active.profile.is_real_money, simulate = settings.simulate,
              rest = %active.profile.rest_url, "environment active");
        Ok((Self { profiles, policies, settings, active, venue_tx }, venue_rx))
    }

    pub fn active(&self) -> &ActiveEnvironment { &self.active }
    pub fn name(&self) -> &str { &self.active.profile.name }
    pub fn is_simulated(&self) -> bool { self.settings.simulate }
    pub fn venue_rx(&self) -> watch::Receiver<Venue> { self.venue_tx.subscribe() }

    pub fn is_healthy(&self) -> bool { self.active.gateway.is_healthy() }

    /// Refuse new entries while the active environment is unhealthy.
    pub fn ensure_healthy(&self) -> Result<(), EntryError> {
        if self.is_healthy() {
            Ok(())
        } else {
            Err(EntryError::Unhealthy)
        }
    }

    /// Replay losing closes from the last 24h into the safety policies so a
    /// restart does not reset the daily loss ceiling. Returns how many were applied.
    pub fn seed_losses(&self, closed: &[Position], now: DateTime<Utc>) -> usize {
        let cutoff = now - ChronoDuration::hours(24);
        let mut recent: Vec<(DateTime<Utc>, f64, &Arc<SafetyPolicy>)> = closed
            .iter()
            .filter_map(|p| match (p.exit_time, p.pnl, self.policies.get(&p.environment)) {
                (Some(at), Some(pnl), Some(policy)) if at > cutoff && pnl < 0.0 => Some((at, pnl, policy)),
                _ => None,
            })
            .collect();
        recent.sort_by_key(|(at, ..)| *at);
        for (at, pnl, policy) in &recent {
            policy.record_pnl(*pnl, *at);
        }
        recent.len()
    }

    /// Base limits narrowed by the active profile's ceilings.
    pub fn risk_limits(&self) -> RiskLimits {
        let p = &self.active.profile;
        let mut l = self.settings.risk.clone();
        l.max_positions = l.max_positions.min(p.max_positions);
        l.max_order_size = l.max_order_size.min(p.max_order_size);
        l
    }

    /// Gate a detected listing before any sizing happens.
    pub fn admit_listing(&self, ev: &ListingEvent) -> Result<(), EntryError> {
        self.ensure_healthy()?;
        if ev.quote_volume < self.settings.min_volume_24h {
            return Err(EntryError::BelowMinVolume { volume: ev.quote_volume, min: self.settings.min_volume_24h });
        }
        Ok(())
    }

    /// Replace the active environment. The caller passes its open-position count;
    /// switching under open positions is refused. On any failure the previous
    /// environment stays active untouched.
    pub fn switch(&mut self, name: &str, open_positions: usize) -> Result<&ActiveEnvironment, ConfigError> {
        if open_positions > 0 {
            return Err(ConfigError::OpenPositions(open_positions));
        }
        let next = match build(&self.profiles, &self.policies, &self.settings, name) {
            Ok(n) => n,
            Err(e) => {
                warn!(target_env = %name, active = %self.active.profile.name, error = %e, "environment switch refused, keeping active profile");
                return Err(e);
            }
        };
        let previous = std::mem::replace(&mut self.active, next);
        publish_gauge(Some(&previous.profile.name), &self.active.profile.name);
        self.venue_tx.send_replace(self.active.venue());
        info!(from = %previous.profile.name, to = %self.active.profile.name, real_money = self.active.profile.is_real_money, "environment switched");
        Ok(&self.active)
    }
}

fn publish_gauge(previous: Option<&str>, current: &str) {
    if let Some(p) = previous {
        CONFIG_ENVIRONMENT.with_label_values(&[p]).set(0);
    }
    CONFIG_ENVIRONMENT.with_label_values(&[current]).set(1);
}

fn build(
    profiles: &HashMap<String, EnvironmentProfile>,
    policies: &HashMap<String, Arc<SafetyPolicy>>,
    settings: &EnvironmentSettings,
    name: &str,
) -> Result<ActiveEnvironment, ConfigError> {
    let profile = profiles.get(name).ok_or_else(|| ConfigError::UnknownProfile(name.to_string()))?.clone();
    profile.validate(settings.simulate)?;

    let mut cfg = settings.client.clone();
    cfg.rest_url = profile.rest_url.clone();
    cfg.api_key = profile.api_key.clone();
    cfg.api_secret = profile.api_secret.clone();
    let client = Arc::new(
        ExchangeClient::new(&profile.name, cfg)
            .map_err(|e| ConfigError::Invalid { profile: profile.name.clone(), reason: e.to_string() })?,
    );

    let live = Arc::new(LiveGateway::new(client.clone(), settings.filter_cache_ttl));
    let mut gateway: Arc<dyn OrderGateway> = if settings.simulate {
        Arc::new(PaperGateway::new(&profile.name, &settings.quote_asset, settings.paper_balance, live))
    } else {
        live
    };

    let policy = policies.get(&profile.name).cloned();
    if let Some(p) = &policy {
        gateway = Arc::new(SafeGateway::new(gateway, p.clone()));
    }
    Ok(ActiveEnvironment { profile, client, gateway, policy })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{CloseReason, OrderResult, OrderStatus};

    fn profile(name: &str, real: bool) -> EnvironmentProfile {
        EnvironmentProfile {
            name: name.into(),
            is_real_money: real,
            rest_url: format!("https://{name}.example.com"),
            stream_url: format!("wss://{name}.example.com/ws"),
            api_key: "k".repeat(64),
            api_secret: "s".repeat(64),
            max_positions: if real { 1 } else { 3 },
            max_order_size: if real { 50.0 } else { 100.0 },
            min_credential_len: DEFAULT_MIN_CREDENTIAL_LEN,
            safety: real.then(|| SafetyLimits { max_order_notional: 100.0, daily_loss_limit: 50.0, stop_loss_pct: 5.0 }),
        }
    }

    fn settings(simulate: bool) -> EnvironmentSettings {
        EnvironmentSettings {
            client: ClientConfig::public("https://unused.example.com"),
            filter_cache_ttl: Duration::from_secs(60),
            simulate,
            paper_balance: 1000.0,
            quote_asset: "USDT".into(),
            min_volume_24h: 1000.0,
            risk: RiskLimits::default(),
            audit: None,
        }
    }

    fn manager() -> (EnvironmentManager, watch::Receiver<Venue>) {
        EnvironmentManager::new(vec![profile("testnet", false), profile("mainnet", true)], settings(false), "testnet").unwrap()
    }

    #[test]
    fn validation_rejects_insecure_endpoints_and_weak_credentials() {
        let mut p = profile("testnet", false);
        p.rest_url = "http://testnet.example.com".into();
        assert!(matches!(p.validate(false), Err(ConfigError::InsecureEndpoint { field: "rest_url", .. })));

        let mut p = profile("testnet", false);
        p.stream_url = "ws://testnet.example.com/ws".into();
        assert!(matches!(p.validate(false), Err(ConfigError::InsecureEndpoint { field: "stream_url", .. })));

        let mut p = profile("testnet", false);
        p.api_secret = "short".into();
        assert!(matches!(p.validate(false), Err(ConfigError::CredentialTooShort { field: "api_secret", .. })));
        p.api_key = String::new();
        assert!(matches!(p.validate(false), Err(ConfigError::MissingCredential { field: "api_key", .. })));
        assert!(p.validate(true).is_ok(), "simulation needs no credentials");

        let mut p = profile("mainnet", true);
        p.safety = None;
        assert!(matches!(p.validate(false), Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn failed_switch_keeps_the_active_environment() {
        let mut bad = profile("mainnet", true);
        bad.api_key = "short".into();
        let (mut m, rx) = EnvironmentManager::new(vec![profile("testnet", false), bad], settings(false), "testnet").unwrap();

        assert!(matches!(m.switch("mainnet", 0), Err(ConfigError::CredentialTooShort { .. })));
        assert!(matches!(m.switch("devnet", 0), Err(ConfigError::UnknownProfile(_))));
        assert_eq!(m.name(), "testnet");
        assert!(!rx.has_changed().unwrap());
    }

    #[test]
    fn switch_is_refused_with_open_positions() {
        let (mut m, _rx) = manager();
        assert_eq!(m.switch("mainnet", 2).err(), Some(ConfigError::OpenPositions(2)));
        assert_eq!(m.name(), "testnet");
    }

    #[test]
    fn switch_publishes_the_new_venue_and_ceilings() {
        let (mut m, mut rx) = manager();
        assert_eq!(m.risk_limits().max_positions, 3);
        let active = m.switch("mainnet", 0).unwrap();
        assert!(active.policy.is_some(), "real money carries the safety policy");
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().profile, "mainnet");
        assert_eq!(m.risk_limits().max_positions, 1);
        assert_eq!(m.risk_limits().max_order_size, 50.0);
    }

    #[test]
    fn listing_gate_checks_volume() {
        let (m, _rx) = manager();
        let mut ev = ListingEvent {
            symbol: "NEWUSDT".into(),
            price: 1.0,
            volume: 10.0,
            quote_volume: 10.0,
            price_change_percent: 0.0,
            detected_at: Utc::now(),
        };
        assert!(matches!(m.admit_listing(&ev), Err(EntryError::BelowMinVolume { .. })));
        ev.quote_volume = 5000.0;
        assert!(m.admit_listing(&ev).is_ok());
    }

    #[test]
    fn loss_history_survives_switching_away_and_back() {
        let (mut m, _rx) = manager();
        m.switch("mainnet", 0).unwrap();
        let policy = m.active().policy.clone().unwrap();
        policy.record_pnl(-49.0, Utc::now());
        assert!(policy.check_entry(50.0, Utc::now()).is_err());

        m.switch("testnet", 0).unwrap();
        let back = m.switch("mainnet", 0).unwrap().policy.clone().unwrap();
        assert!(Arc::ptr_eq(&policy, &back));
        assert!((back.lost_24h(Utc::now()) - 49.0).abs() < 1e-9);
        assert!(back.check_entry(50.0, Utc::now()).is_err());
    }

    fn closed(env: &str, entry: f64, exit: f64, hours_ago: i64) -> Position {
        let fill = OrderResult {
            order_id: 1,
            client_order_id: "lb-1".into(),
            symbol: "NEWUSDT".into(),
            status: OrderStatus::Filled,
            executed_qty: 10.0,
            avg_price: entry,
        };
        let mut p = Position::from_fill(&fill, entry * 1.1, entry * 0.95, env);
        p.close(exit, CloseReason::StopLoss, Utc::now() - ChronoDuration::hours(hours_ago)).unwrap();
        p
    }

    #[test]
    fn recent_real_money_losses_are_restored() {
        let (m, _rx) = manager();
        let history = vec![
            closed("mainnet", 2.0, 1.0, 30), // outside the window
            closed("mainnet", 2.0, 1.5, 2),  // -5
            closed("mainnet", 2.0, 1.0, 1),  // -10
            closed("mainnet", 2.0, 3.0, 1),  // a gain
            closed("testnet", 2.0, 1.0, 1),  // no policy
        ];
        assert_eq!(m.seed_losses(&history, Utc::now()), 2);
        let policy = m.policies.get("mainnet").unwrap();
        assert!((policy.lost_24h(Utc::now()) - 15.0).abs() < 1e-9);
    }

    #[test]
    fn simulated_environment_turns_unhealthy_with_its_client() {
        let (m, _rx) = EnvironmentManager::new(vec![profile("testnet", false)], settings(true), "testnet").unwrap();
        assert!(m.ensure_healthy().is_ok());
        m.active().client.mark_unhealthy();
        assert!(!m.is_healthy());
        assert!(matches!(m.ensure_healthy(), Err(EntryError::Unhealthy)));
    }
}
