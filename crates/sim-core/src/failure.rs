//! Probabilistic synthesis of typed error responses.

use sim_common::config::{Config, FailureKind};

use crate::random::Rng;

#[derive(Debug, Clone, PartialEq)]
pub struct InjectedFailure {
    pub status: u16,
    pub error_type: String,
    pub message: String,
    pub param: Option<String>,
}

/// Draws U(1, 100) once per request; at or below the configured rate a
/// failure is picked uniformly from the allowed kinds (all kinds when the
/// list is empty).
pub fn maybe_inject(cfg: &Config, rng: &Rng, model_name: &str) -> Option<InjectedFailure> {
    if cfg.failure_injection_rate == 0 {
        return None;
    }
    if rng.int_in(1u32..=100) > cfg.failure_injection_rate {
        return None;
    }
    let kinds: &[FailureKind] = if cfg.failure_types.is_empty() {
        &FailureKind::ALL
    } else {
        &cfg.failure_types
    };
    Some(build(*rng.pick(kinds), model_name))
}

fn build(kind: FailureKind, model: &str) -> InjectedFailure {
    match kind {
        FailureKind::RateLimit => InjectedFailure {
            status: 429,
            error_type: "rate_limit_exceeded".into(),
            message: format!(
                "Rate limit reached for {model} in organization org-simulated on requests per min. Limit: 3 / min."
            ),
            param: None,
        },
        FailureKind::InvalidApiKey => InjectedFailure {
            status: 401,
            error_type: "invalid_request_error".into(),
            message: "Incorrect API key provided.".into(),
            param: None,
        },
        FailureKind::ContextLength => InjectedFailure {
            status: 400,
            error_type: "invalid_request_error".into(),
            message: format!(
                "This model's maximum context length is exceeded for {model}."
            ),
            param: Some("messages".into()),
        },
        FailureKind::ServerError => InjectedFailure {
            status: 503,
            error_type: "server_error".into(),
            message: "The server had an error while processing your request.".into(),
            param: None,
        },
        FailureKind::InvalidRequest => InjectedFailure {
            status: 400,
            error_type: "invalid_request_error".into(),
            message: format!("Invalid request for model {model}."),
            param: Some("model".into()),
        },
        FailureKind::ModelNotFound => InjectedFailure {
            status: 404,
            error_type: "not_found_error".into(),
            message: format!("The model `{model}` does not exist."),
            param: Some("model".into()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_rate_never_injects() {
        let cfg = Config::default();
        let rng = Rng::seeded(3);
        for _ in 0..100 {
            assert!(maybe_inject(&cfg, &rng, "m").is_none());
        }
    }

    #[test]
    fn full_rate_always_injects_configured_kind() {
        let mut cfg = Config::default();
        cfg.failure_injection_rate = 100;
        cfg.failure_types = vec![FailureKind::RateLimit];
        let rng = Rng::seeded(3);
        for _ in 0..20 {
            let failure = maybe_inject(&cfg, &rng, "m").unwrap();
            assert_eq!(failure.status, 429);
            assert!(failure.message.contains('m'));
        }
    }

    #[test]
    fn unset_kinds_draw_from_all_six() {
        let mut cfg = Config::default();
        cfg.failure_injection_rate = 100;
        let rng = Rng::seeded(3);
        let mut statuses = std::collections::HashSet::new();
        for _ in 0..200 {
            statuses.insert(maybe_inject(&cfg, &rng, "m").unwrap().status);
        }
        assert!(statuses.len() >= 4, "expected a spread of statuses");
    }
}
