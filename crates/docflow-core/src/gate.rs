//! Per-phase run/skip decisions.
//!
//! Each gate is one exhaustive, side-effect-free function over a small
//! input struct. The worker records every [`PhaseDecision`] as a trace
//! event; nothing here touches storage.
//!
//! # Transform
//!
//! | condition | outcome | reason |
//! |---|---|---|
//! | callback completed, frontmatter complete from body | skip | `template_completed_fm_ok` |
//! | callback completed, frontmatter incomplete, needs repair | run | `template_completed_repair` |
//! | callback completed, frontmatter incomplete, no repair | skip | `template_completed_no_repair` |
//! | policy `force` | run | `policy_force` |
//! | policy `skip` | skip | `policy_skip` |
//! | policy `ignore` | skip | `policy_ignore` |
//! | `auto`, frontmatter complete from body | skip | `frontmatter_complete_body` |
//! | `auto`, gate exists and no repair needed | skip | `artifact_gate_exists` |
//! | `auto`, otherwise | run | `auto_no_gate` |
//!
//! Policy `do` is evaluated like `auto` in every gate.

use std::fmt;

use serde::Serialize;

use crate::models::{Phase, PhasePolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GateAction {
    Run,
    Skip,
}

impl GateAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            GateAction::Run => "run",
            GateAction::Skip => "skip",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GateReason {
    TemplateCompletedFmOk,
    TemplateCompletedRepair,
    TemplateCompletedNoRepair,
    ExtractCompletedCallback,
    PolicyForce,
    PolicySkip,
    PolicyIgnore,
    FrontmatterCompleteBody,
    ArtifactGateExists,
    AutoNoGate,
    NoMarkdown,
    FrontmatterInvalid,
    AlreadyIngested,
}

impl GateReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            GateReason::TemplateCompletedFmOk => "template_completed_fm_ok",
            GateReason::TemplateCompletedRepair => "template_completed_repair",
            GateReason::TemplateCompletedNoRepair => "template_completed_no_repair",
            GateReason::ExtractCompletedCallback => "extract_completed_callback",
            GateReason::PolicyForce => "policy_force",
            GateReason::PolicySkip => "policy_skip",
            GateReason::PolicyIgnore => "policy_ignore",
            GateReason::FrontmatterCompleteBody => "frontmatter_complete_body",
            GateReason::ArtifactGateExists => "artifact_gate_exists",
            GateReason::AutoNoGate => "auto_no_gate",
            GateReason::NoMarkdown => "no_markdown",
            GateReason::FrontmatterInvalid => "frontmatter_invalid",
            GateReason::AlreadyIngested => "already_ingested",
        }
    }
}

impl fmt::Display for GateReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a gate: run or skip, plus why.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PhaseDecision {
    pub phase: Phase,
    pub action: GateAction,
    pub reason: GateReason,
}

impl PhaseDecision {
    fn run(phase: Phase, reason: GateReason) -> Self {
        Self {
            phase,
            action: GateAction::Run,
            reason,
        }
    }

    fn skip(phase: Phase, reason: GateReason) -> Self {
        Self {
            phase,
            action: GateAction::Skip,
            reason,
        }
    }

    pub fn should_run(&self) -> bool {
        self.action == GateAction::Run
    }

    /// Attributes for the `gate_decision` trace event.
    pub fn trace_attributes(&self) -> serde_json::Value {
        serde_json::json!({
            "phase": self.phase.as_str(),
            "action": self.action.as_str(),
            "reason": self.reason.as_str(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransformGateInput {
    /// The provider already ran the phase and reported back out-of-band.
    pub is_callback_completed: bool,
    /// The callback payload itself carries complete core frontmatter.
    pub is_frontmatter_complete_from_body: bool,
    /// An artifact exists but lacks core fields.
    pub needs_repair: bool,
    pub policy: PhasePolicy,
    /// A valid artifact is already present.
    pub gate_exists: bool,
}

pub fn decide_transform(input: &TransformGateInput) -> PhaseDecision {
    let phase = Phase::Transform;

    if input.is_callback_completed {
        return match (input.is_frontmatter_complete_from_body, input.needs_repair) {
            (true, _) => PhaseDecision::skip(phase, GateReason::TemplateCompletedFmOk),
            (false, true) => PhaseDecision::run(phase, GateReason::TemplateCompletedRepair),
            (false, false) => PhaseDecision::skip(phase, GateReason::TemplateCompletedNoRepair),
        };
    }

    match input.policy {
        PhasePolicy::Force => PhaseDecision::run(phase, GateReason::PolicyForce),
        PhasePolicy::Skip => PhaseDecision::skip(phase, GateReason::PolicySkip),
        PhasePolicy::Ignore => PhaseDecision::skip(phase, GateReason::PolicyIgnore),
        PhasePolicy::Auto | PhasePolicy::Do => {
            if input.is_frontmatter_complete_from_body {
                PhaseDecision::skip(phase, GateReason::FrontmatterCompleteBody)
            } else if input.gate_exists && !input.needs_repair {
                PhaseDecision::skip(phase, GateReason::ArtifactGateExists)
            } else {
                PhaseDecision::run(phase, GateReason::AutoNoGate)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExtractGateInput {
    pub is_callback_completed: bool,
    pub policy: PhasePolicy,
    /// A transcript exists, or a transformation does (superset rule).
    pub gate_exists: bool,
}

pub fn decide_extract(input: &ExtractGateInput) -> PhaseDecision {
    let phase = Phase::Extract;

    if input.is_callback_completed {
        return PhaseDecision::skip(phase, GateReason::ExtractCompletedCallback);
    }

    match input.policy {
        PhasePolicy::Force => PhaseDecision::run(phase, GateReason::PolicyForce),
        PhasePolicy::Skip => PhaseDecision::skip(phase, GateReason::PolicySkip),
        PhasePolicy::Ignore => PhaseDecision::skip(phase, GateReason::PolicyIgnore),
        PhasePolicy::Auto | PhasePolicy::Do => {
            if input.gate_exists {
                PhaseDecision::skip(phase, GateReason::ArtifactGateExists)
            } else {
                PhaseDecision::run(phase, GateReason::AutoNoGate)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IngestGateInput {
    pub policy: PhasePolicy,
    pub has_markdown: bool,
    pub frontmatter_valid: bool,
    /// The index already holds this exact artifact revision.
    pub already_ingested: bool,
}

pub fn decide_ingest(input: &IngestGateInput) -> PhaseDecision {
    let phase = Phase::Ingest;

    match input.policy {
        PhasePolicy::Skip => return PhaseDecision::skip(phase, GateReason::PolicySkip),
        PhasePolicy::Ignore => return PhaseDecision::skip(phase, GateReason::PolicyIgnore),
        _ => {}
    }

    if !input.has_markdown {
        return PhaseDecision::skip(phase, GateReason::NoMarkdown);
    }

    if input.policy == PhasePolicy::Force {
        return PhaseDecision::run(phase, GateReason::PolicyForce);
    }

    if !input.frontmatter_valid {
        PhaseDecision::skip(phase, GateReason::FrontmatterInvalid)
    } else if input.already_ingested {
        PhaseDecision::skip(phase, GateReason::AlreadyIngested)
    } else {
        PhaseDecision::run(phase, GateReason::AutoNoGate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_POLICIES: [PhasePolicy; 5] = [
        PhasePolicy::Do,
        PhasePolicy::Ignore,
        PhasePolicy::Force,
        PhasePolicy::Skip,
        PhasePolicy::Auto,
    ];

    fn transform(
        callback: bool,
        fm_body: bool,
        repair: bool,
        policy: PhasePolicy,
        gate: bool,
    ) -> PhaseDecision {
        decide_transform(&TransformGateInput {
            is_callback_completed: callback,
            is_frontmatter_complete_from_body: fm_body,
            needs_repair: repair,
            policy,
            gate_exists: gate,
        })
    }

    #[test]
    fn callback_rows_ignore_policy_and_gate() {
        for policy in ALL_POLICIES {
            for gate in [false, true] {
                for repair in [false, true] {
                    let d = transform(true, true, repair, policy, gate);
                    assert_eq!(d.reason, GateReason::TemplateCompletedFmOk);
                    assert!(!d.should_run());
                }
                let d = transform(true, false, true, policy, gate);
                assert_eq!(d.reason, GateReason::TemplateCompletedRepair);
                assert!(d.should_run());

                let d = transform(true, false, false, policy, gate);
                assert_eq!(d.reason, GateReason::TemplateCompletedNoRepair);
                assert!(!d.should_run());
            }
        }
    }

    #[test]
    fn explicit_policies_win_without_callback() {
        for fm in [false, true] {
            for gate in [false, true] {
                for repair in [false, true] {
                    let d = transform(false, fm, repair, PhasePolicy::Force, gate);
                    assert_eq!((d.action, d.reason), (GateAction::Run, GateReason::PolicyForce));
                    let d = transform(false, fm, repair, PhasePolicy::Skip, gate);
                    assert_eq!((d.action, d.reason), (GateAction::Skip, GateReason::PolicySkip));
                    let d = transform(false, fm, repair, PhasePolicy::Ignore, gate);
                    assert_eq!(
                        (d.action, d.reason),
                        (GateAction::Skip, GateReason::PolicyIgnore)
                    );
                }
            }
        }
    }

    #[test]
    fn auto_ladder() {
        for policy in [PhasePolicy::Auto, PhasePolicy::Do] {
            let d = transform(false, true, false, policy, false);
            assert_eq!(d.reason, GateReason::FrontmatterCompleteBody);
            assert!(!d.should_run());

            let d = transform(false, false, false, policy, true);
            assert_eq!(d.reason, GateReason::ArtifactGateExists);
            assert!(!d.should_run());

            let d = transform(false, false, false, policy, false);
            assert_eq!(d.reason, GateReason::AutoNoGate);
            assert!(d.should_run());
        }
    }

    #[test]
    fn repair_overrides_existing_gate() {
        let d = transform(false, false, true, PhasePolicy::Auto, true);
        assert!(d.should_run());
        assert_eq!(d.reason, GateReason::AutoNoGate);
    }

    #[test]
    fn decisions_are_stable_across_calls() {
        let input = TransformGateInput {
            gate_exists: true,
            ..Default::default()
        };
        assert_eq!(decide_transform(&input), decide_transform(&input));
        assert!(!decide_transform(&input).should_run());
    }

    #[test]
    fn extract_superset_gate_skips() {
        let d = decide_extract(&ExtractGateInput {
            gate_exists: true,
            ..Default::default()
        });
        assert_eq!(d.reason, GateReason::ArtifactGateExists);

        let d = decide_extract(&ExtractGateInput::default());
        assert!(d.should_run());

        let d = decide_extract(&ExtractGateInput {
            is_callback_completed: true,
            policy: PhasePolicy::Force,
            gate_exists: false,
        });
        assert_eq!(d.reason, GateReason::ExtractCompletedCallback);
    }

    #[test]
    fn ingest_withheld_until_frontmatter_valid() {
        let d = decide_ingest(&IngestGateInput {
            policy: PhasePolicy::Auto,
            has_markdown: true,
            frontmatter_valid: false,
            already_ingested: false,
        });
        assert_eq!(d.reason, GateReason::FrontmatterInvalid);

        let d = decide_ingest(&IngestGateInput {
            policy: PhasePolicy::Auto,
            has_markdown: true,
            frontmatter_valid: true,
            already_ingested: true,
        });
        assert_eq!(d.reason, GateReason::AlreadyIngested);

        let d = decide_ingest(&IngestGateInput {
            policy: PhasePolicy::Force,
            has_markdown: true,
            frontmatter_valid: false,
            already_ingested: true,
        });
        assert_eq!(d.reason, GateReason::PolicyForce);

        let d = decide_ingest(&IngestGateInput {
            policy: PhasePolicy::Force,
            ..Default::default()
        });
        assert_eq!(d.reason, GateReason::NoMarkdown);
    }

    #[test]
    fn trace_attributes_use_wire_names() {
        let d = transform(true, true, false, PhasePolicy::Auto, false);
        let attrs = d.trace_attributes();
        assert_eq!(attrs["phase"], "transform");
        assert_eq!(attrs["action"], "skip");
        assert_eq!(attrs["reason"], "template_completed_fm_ok");
    }
}
