// Cojoin Engine — Anti-Automation Gate
//
// Three independent checks stand between a form and the network:
//
//   1. Honeypot: hidden decoy fields injected ahead of the first real field.
//      Any value or checked state, observed on interaction or at submit,
//      trips the gate for the rest of the session.
//   2. CAPTCHA: a provider-agnostic token source. Failure is a hard stop.
//   3. Nonce: a fresh random value claimed against a uniqueness registry.
//      Collisions regenerate and retry, bounded by `max_attempts`.
//
// `ProofMode` decides which of 2 and 3 every outbound send must carry.

use crate::atoms::constants::{HP_CHECK_ID, HP_TEXT_ID};
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{CaptchaProviderKind, ChatRequest, HoneypotTrip, NonceClaim, ProofMode};
use crate::engine::crypto;
use crate::engine::dom::{Document, NodeId};
use async_trait::async_trait;
use log::{info, warn};
use std::collections::BTreeMap;
use std::sync::Arc;

// ── Honeypot ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Honeypot {
    pub wrapper: NodeId,
    pub text: NodeId,
    pub check: NodeId,
}

impl Honeypot {
    /// Any non-blank text or a checked box means something filled the decoys.
    pub fn is_filled(&self, doc: &Document) -> bool {
        !doc.value(self.text).trim().is_empty()
            || doc.element(self.check).map(|e| e.checked).unwrap_or(false)
    }

    pub fn contains(&self, doc: &Document, node: NodeId) -> bool {
        doc.contains(self.wrapper, node)
    }
}

fn is_field(doc: &Document, node: NodeId) -> bool {
    doc.element(node)
        .map(|e| matches!(e.tag.as_str(), "input" | "textarea" | "select" | "button"))
        .unwrap_or(false)
}

/// Insert the decoy pair ahead of the form's first real field.
/// Reuses decoys already present in the form.
pub fn inject_honeypot(doc: &mut Document, form: NodeId) -> Option<Honeypot> {
    if !doc.exists(form) {
        return None;
    }
    if let (Some(text), Some(check)) = (doc.find_by_id(form, HP_TEXT_ID), doc.find_by_id(form, HP_CHECK_ID)) {
        let wrapper = doc.parent(text).unwrap_or(form);
        return Some(Honeypot { wrapper, text, check });
    }

    let wrapper = doc.create_element("div");
    let text = doc.create_element("input");
    let check = doc.create_element("input");
    if let Some(el) = doc.element_mut(wrapper) {
        el.add_class("hp-field");
    }
    doc.set_hidden(wrapper, true);
    for (node, kind, id) in [(text, "text", HP_TEXT_ID), (check, "checkbox", HP_CHECK_ID)] {
        if let Some(el) = doc.element_mut(node) {
            el.id = Some(id.to_string());
            el.set_attr("type", kind);
            el.set_attr("name", id);
            el.set_attr("tabindex", "-1");
            el.set_attr("autocomplete", "off");
        }
    }
    doc.append_child(wrapper, text);
    doc.append_child(wrapper, check);

    let first_field = doc.descendants(form).into_iter().find(|n| is_field(doc, *n));
    match first_field.and_then(|f| doc.parent(f).map(|p| (p, f))) {
        Some((parent, field)) => doc.insert_before(parent, wrapper, field),
        None => doc.append_child(form, wrapper),
    }
    Some(Honeypot { wrapper, text, check })
}

/// Per-form gate state. Once tripped it never resets.
#[derive(Debug)]
pub struct GateHandle {
    pub form: NodeId,
    pub honeypot: Honeypot,
    tripped: bool,
}

impl GateHandle {
    pub fn attach(doc: &mut Document, form: NodeId) -> Option<Self> {
        let honeypot = inject_honeypot(doc, form)?;
        Some(GateHandle { form, honeypot, tripped: false })
    }

    pub fn is_tripped(&self) -> bool {
        self.tripped
    }

    /// Inspect the decoys; trips when filled. Returns the report payload the
    /// first time only.
    pub fn inspect(&mut self, doc: &mut Document, reason: &str, user_agent: &str) -> Option<HoneypotTrip> {
        if self.tripped || !self.honeypot.is_filled(doc) {
            return None;
        }
        Some(self.trip(doc, reason, user_agent))
    }

    /// Lock every real control in the form.
    pub fn trip(&mut self, doc: &mut Document, reason: &str, user_agent: &str) -> HoneypotTrip {
        self.tripped = true;
        let controls: Vec<NodeId> = doc
            .descendants(self.form)
            .into_iter()
            .filter(|n| is_field(doc, *n) && !self.honeypot.contains(doc, *n))
            .collect();
        for node in controls {
            doc.set_disabled(node, true);
        }
        warn!("[gate] Honeypot tripped ({})", reason);
        HoneypotTrip {
            reason: reason.to_string(),
            ts: chrono::Utc::now().timestamp_millis(),
            ua: user_agent.to_string(),
        }
    }
}

// ── CAPTCHA ────────────────────────────────────────────────────────────

#[async_trait]
pub trait CaptchaProvider: Send + Sync {
    fn kind(&self) -> CaptchaProviderKind;
    async fn token(&self, action: &str) -> EngineResult<String>;
}

/// Returns a fixed token. Pairs with provider test keys in development.
pub struct StaticCaptcha {
    pub kind: CaptchaProviderKind,
    pub token: String,
}

#[async_trait]
impl CaptchaProvider for StaticCaptcha {
    fn kind(&self) -> CaptchaProviderKind {
        self.kind
    }

    async fn token(&self, _action: &str) -> EngineResult<String> {
        Ok(self.token.clone())
    }
}

// ── Nonce registry ─────────────────────────────────────────────────────

#[async_trait]
pub trait NonceRegistrar: Send + Sync {
    /// Atomically claim `nonce`. `Reused` when it was seen before.
    async fn register(&self, nonce: &str) -> EngineResult<NonceClaim>;
}

/// Best-effort sink for honeypot trips. Failures are swallowed by callers.
#[async_trait]
pub trait TripReporter: Send + Sync {
    async fn report(&self, trip: &HoneypotTrip) -> EngineResult<()>;
}

pub type NonceGenerator = Arc<dyn Fn() -> String + Send + Sync>;

pub fn default_nonce_generator() -> NonceGenerator {
    Arc::new(crypto::fresh_nonce)
}

// ── Proof ──────────────────────────────────────────────────────────────

/// Artifacts attached to one outbound send.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Proof {
    pub nonce: Option<String>,
    pub captcha: Option<(CaptchaProviderKind, String)>,
}

impl Proof {
    pub fn apply_to(&self, req: &mut ChatRequest) {
        req.nonce = self.nonce.clone();
        match &self.captcha {
            Some((CaptchaProviderKind::Recaptcha, t)) => req.recaptcha_token = Some(t.clone()),
            Some((CaptchaProviderKind::Hcaptcha, t)) => req.hcaptcha_response = Some(t.clone()),
            None => {}
        }
    }

    /// Relay field names: `nonce` and `recaptchaToken`.
    pub fn apply_to_fields(&self, fields: &mut BTreeMap<String, String>) {
        if let Some(n) = &self.nonce {
            fields.insert("nonce".into(), n.clone());
        }
        if let Some((_, t)) = &self.captcha {
            fields.insert("recaptchaToken".into(), t.clone());
        }
    }
}

/// Where a nonce gets claimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonceUse {
    /// The client claims it through the registrar before sending.
    Register,
    /// The receiving relay claims it; the client only generates.
    Relay,
}

pub struct ProofGate {
    pub mode: ProofMode,
    captcha: Option<Arc<dyn CaptchaProvider>>,
    registrar: Option<Arc<dyn NonceRegistrar>>,
    generator: NonceGenerator,
    max_attempts: u32,
}

impl ProofGate {
    pub fn new(
        mode: ProofMode,
        captcha: Option<Arc<dyn CaptchaProvider>>,
        registrar: Option<Arc<dyn NonceRegistrar>>,
        generator: NonceGenerator,
        max_attempts: u32,
    ) -> Self {
        ProofGate { mode, captcha, registrar, generator, max_attempts: max_attempts.max(1) }
    }

    pub fn generate_nonce(&self) -> String {
        (self.generator)()
    }

    /// Fetch a CAPTCHA token. Any failure or an empty token is a security rejection.
    pub async fn captcha_token(&self, action: &str) -> EngineResult<(CaptchaProviderKind, String)> {
        let provider = self
            .captcha
            .as_ref()
            .ok_or_else(|| EngineError::Security("no CAPTCHA provider configured".into()))?;
        match provider.token(action).await {
            Ok(t) if !t.trim().is_empty() => Ok((provider.kind(), t)),
            Ok(_) => Err(EngineError::Security("CAPTCHA returned an empty token".into())),
            Err(e) => {
                warn!("[gate] CAPTCHA acquisition failed: {}", e);
                Err(EngineError::Security("CAPTCHA acquisition failed".into()))
            }
        }
    }

    /// Claim a fresh nonce, regenerating on collision. Transport failures
    /// consume an attempt too. Exhaustion leaves the gate unavailable.
    pub async fn register_nonce(&self) -> EngineResult<String> {
        let registrar = self
            .registrar
            .as_ref()
            .ok_or_else(|| EngineError::Security("no nonce registrar configured".into()))?;
        for attempt in 1..=self.max_attempts {
            let nonce = self.generate_nonce();
            match registrar.register(&nonce).await {
                Ok(NonceClaim::Claimed) => {
                    info!("[gate] Nonce claimed on attempt {}", attempt);
                    return Ok(nonce);
                }
                Ok(NonceClaim::Reused) => {
                    warn!("[gate] Nonce collision on attempt {}/{}", attempt, self.max_attempts);
                }
                Err(e) => {
                    warn!("[gate] Nonce registration error on attempt {}/{}: {}", attempt, self.max_attempts, e);
                }
            }
        }
        Err(EngineError::transport("nonce", format!("unavailable after {} attempts", self.max_attempts)))
    }

    /// Assemble the artifacts `mode` requires. `current` is a nonce already
    /// claimed for this conversation and still valid.
    pub async fn prove(&self, action: &str, current: Option<&str>, usage: NonceUse) -> EngineResult<Proof> {
        let mut proof = Proof::default();
        if self.mode.needs_captcha() {
            proof.captcha = Some(self.captcha_token(action).await?);
        }
        if self.mode.needs_nonce() {
            proof.nonce = Some(match (current, usage) {
                (Some(n), NonceUse::Register) => n.to_string(),
                (None, NonceUse::Register) => self.register_nonce().await?,
                (_, NonceUse::Relay) => self.generate_nonce(),
            });
        }
        Ok(proof)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::dom::Viewport;
    use parking_lot::Mutex;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct SetRegistrar(Mutex<HashSet<String>>);

    #[async_trait]
    impl NonceRegistrar for SetRegistrar {
        async fn register(&self, nonce: &str) -> EngineResult<NonceClaim> {
            Ok(if self.0.lock().insert(nonce.to_string()) { NonceClaim::Claimed } else { NonceClaim::Reused })
        }
    }

    struct FailingCaptcha;

    #[async_trait]
    impl CaptchaProvider for FailingCaptcha {
        fn kind(&self) -> CaptchaProviderKind {
            CaptchaProviderKind::Recaptcha
        }
        async fn token(&self, _action: &str) -> EngineResult<String> {
            Err(EngineError::transport("captcha", "script blocked"))
        }
    }

    fn sequence(values: &'static [&'static str]) -> NonceGenerator {
        let i = Arc::new(AtomicUsize::new(0));
        Arc::new(move || values[i.fetch_add(1, Ordering::SeqCst).min(values.len() - 1)].to_string())
    }

    fn form_doc() -> (Document, NodeId, NodeId) {
        let mut doc = Document::new("https://site.test", Viewport::new(1024.0, 768.0));
        let form = doc.create_element("form");
        let name = doc.create_element("input");
        doc.append_child(doc.body(), form);
        doc.append_child(form, name);
        (doc, form, name)
    }

    #[test]
    fn honeypot_goes_before_first_field() {
        let (mut doc, form, name) = form_doc();
        let hp = inject_honeypot(&mut doc, form).unwrap();
        assert_eq!(doc.children(form), &[hp.wrapper, name]);
        assert!(doc.element(hp.wrapper).unwrap().hidden);
        assert_eq!(inject_honeypot(&mut doc, form), Some(hp));
    }

    #[test]
    fn trip_is_reported_once_and_locks_controls() {
        let (mut doc, form, name) = form_doc();
        let mut gate = GateHandle::attach(&mut doc, form).unwrap();
        assert!(gate.inspect(&mut doc, "input", "ua").is_none());
        doc.set_checked(gate.honeypot.check, true);
        let report = gate.inspect(&mut doc, "honeypot_on_input", "ua").unwrap();
        assert_eq!(report.reason, "honeypot_on_input");
        assert!(doc.is_disabled(name));
        assert!(!doc.is_disabled(gate.honeypot.text));
        doc.set_checked(gate.honeypot.check, false);
        assert!(gate.inspect(&mut doc, "again", "ua").is_none());
        assert!(gate.is_tripped());
    }

    #[test]
    fn whitespace_does_not_fill_the_decoy() {
        let (mut doc, form, _) = form_doc();
        let hp = inject_honeypot(&mut doc, form).unwrap();
        doc.set_value(hp.text, "   ");
        assert!(!hp.is_filled(&doc));
        doc.set_value(hp.text, "bot");
        assert!(hp.is_filled(&doc));
    }

    #[tokio::test]
    async fn collision_regenerates_then_claims() {
        let reg = Arc::new(SetRegistrar(Mutex::new(HashSet::from(["dup".to_string()]))));
        let gate = ProofGate::new(ProofMode::Nonce, None, Some(reg), sequence(&["dup", "fresh"]), 3);
        assert_eq!(gate.register_nonce().await.unwrap(), "fresh");
    }

    #[tokio::test]
    async fn exhausted_attempts_are_unavailable() {
        let reg = Arc::new(SetRegistrar(Mutex::new(HashSet::from(["dup".to_string()]))));
        let gate = ProofGate::new(ProofMode::Nonce, None, Some(reg), sequence(&["dup"]), 3);
        assert!(matches!(gate.register_nonce().await, Err(EngineError::Transport { .. })));
    }

    #[tokio::test]
    async fn captcha_failure_is_security() {
        let gate = ProofGate::new(
            ProofMode::CaptchaAndNonce,
            Some(Arc::new(FailingCaptcha)),
            None,
            default_nonce_generator(),
            3,
        );
        let err = gate.prove("chat", None, NonceUse::Register).await.unwrap_err();
        assert!(err.is_security());
    }

    #[tokio::test]
    async fn proof_fills_provider_specific_field() {
        let gate = ProofGate::new(
            ProofMode::Captcha,
            Some(Arc::new(StaticCaptcha { kind: CaptchaProviderKind::Hcaptcha, token: "tok".into() })),
            None,
            default_nonce_generator(),
            3,
        );
        let proof = gate.prove("chat", None, NonceUse::Register).await.unwrap();
        let mut req = ChatRequest { message: "hi".into(), ..Default::default() };
        proof.apply_to(&mut req);
        assert_eq!(req.hcaptcha_response.as_deref(), Some("tok"));
        assert!(req.nonce.is_none());
    }
}
