// Validation rules for settings patches

use super::types::{ChatTemplatePatch, CompletionSettingsPatch};

/// Inclusive numeric range a field must fall in
#[derive(Debug, Clone, Copy)]
pub struct ValidationRule {
    pub min: f64,
    pub max: f64,
}

const fn rule(min: f64, max: f64) -> ValidationRule {
    ValidationRule { min, max }
}

/// Numeric limits for completion settings, by field name
pub const COMPLETION_RULES: &[(&str, ValidationRule)] = &[
    ("n_predict", rule(1.0, 4096.0)),
    ("temperature", rule(0.0, 1.0)),
    ("top_k", rule(1.0, 128.0)),
    ("top_p", rule(0.0, 1.0)),
    ("min_p", rule(0.0, 1.0)),
    ("xtc_threshold", rule(0.0, 1.0)),
    ("xtc_probability", rule(0.0, 1.0)),
    ("typical_p", rule(0.0, 2.0)),
    ("penalty_last_n", rule(0.0, 256.0)),
    ("penalty_repeat", rule(0.0, 2.0)),
    ("penalty_freq", rule(0.0, 2.0)),
    ("penalty_present", rule(0.0, 2.0)),
    ("mirostat", rule(0.0, 2.0)),
    ("mirostat_tau", rule(0.0, 10.0)),
    ("mirostat_eta", rule(0.0, 1.0)),
    ("seed", rule(0.0, 9_007_199_254_740_991.0)),
    ("n_probs", rule(0.0, 100.0)),
];

fn rule_for(field: &str) -> Option<ValidationRule> {
    COMPLETION_RULES
        .iter()
        .find(|(name, _)| *name == field)
        .map(|(_, r)| *r)
}

fn check(errors: &mut Vec<String>, field: &str, value: Option<f64>) {
    let (Some(value), Some(r)) = (value, rule_for(field)) else {
        return;
    };
    if !value.is_finite() || value < r.min || value > r.max {
        errors.push(format!("{} must be between {} and {}", field, r.min, r.max));
    }
}

/// Returns every out-of-range field, empty when the patch is valid
pub fn validate_completion_patch(patch: &CompletionSettingsPatch) -> Vec<String> {
    let mut errors = Vec::new();

    check(&mut errors, "n_predict", patch.n_predict.map(f64::from));
    check(&mut errors, "temperature", patch.temperature.map(f64::from));
    check(&mut errors, "top_k", patch.top_k.map(f64::from));
    check(&mut errors, "top_p", patch.top_p.map(f64::from));
    check(&mut errors, "min_p", patch.min_p.map(f64::from));
    check(&mut errors, "xtc_threshold", patch.xtc_threshold.map(f64::from));
    check(&mut errors, "xtc_probability", patch.xtc_probability.map(f64::from));
    check(&mut errors, "typical_p", patch.typical_p.map(f64::from));
    check(&mut errors, "penalty_last_n", patch.penalty_last_n.map(f64::from));
    check(&mut errors, "penalty_repeat", patch.penalty_repeat.map(f64::from));
    check(&mut errors, "penalty_freq", patch.penalty_freq.map(f64::from));
    check(&mut errors, "penalty_present", patch.penalty_present.map(f64::from));
    check(&mut errors, "mirostat", patch.mirostat.map(f64::from));
    check(&mut errors, "mirostat_tau", patch.mirostat_tau.map(f64::from));
    check(&mut errors, "mirostat_eta", patch.mirostat_eta.map(f64::from));
    check(&mut errors, "seed", patch.seed.map(|s| s as f64));
    check(&mut errors, "n_probs", patch.n_probs.map(f64::from));

    if let Some(stop) = &patch.stop {
        if stop.iter().any(|s| s.is_empty()) {
            errors.push("stop sequences must not be empty".to_string());
        }
    }

    errors
}

pub fn validate_chat_template_patch(patch: &ChatTemplatePatch) -> Vec<String> {
    let mut errors = Vec::new();

    if let Some(name) = &patch.name {
        if name.trim().is_empty() {
            errors.push("template name must not be blank".to_string());
        }
    }

    errors
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_patch_has_no_errors() {
        let patch = CompletionSettingsPatch {
            temperature: Some(0.5),
            top_k: Some(128),
            n_predict: Some(1),
            ..Default::default()
        };
        assert!(validate_completion_patch(&patch).is_empty());
    }

    #[test]
    fn test_out_of_range_fields_are_reported() {
        let patch = CompletionSettingsPatch {
            temperature: Some(1.5),
            top_k: Some(0),
            n_predict: Some(5000),
            mirostat_tau: Some(f32::NAN),
            ..Default::default()
        };
        let errors = validate_completion_patch(&patch);
        assert_eq!(errors.len(), 4);
        assert!(errors[0].starts_with("n_predict"));
    }

    #[test]
    fn test_blank_template_name_is_rejected() {
        let patch = ChatTemplatePatch {
            name: Some("  ".to_string()),
            ..Default::default()
        };
        assert_eq!(validate_chat_template_patch(&patch).len(), 1);

        let blank_prompt = ChatTemplatePatch {
            system_prompt: Some(String::new()),
            ..Default::default()
        };
        assert!(validate_chat_template_patch(&blank_prompt).is_empty());
    }
}
