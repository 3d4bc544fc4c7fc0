//! Path and user-agent matching shared by the request middlewares
//!
//! Every gating middleware carries a [`RequestMatcher`] deciding whether the
//! middleware applies to a given request. Precedence is fixed regardless of
//! configuration order: exclude-path, exclude-user-agent, include-path,
//! include-user-agent, then the configured default.

use crate::config::MatchRules;
use regex::Regex;

/// Compiled include/exclude rules plus the default verdict
pub struct RequestMatcher {
    default_skip: bool,
    include_path: Option<Regex>,
    exclude_path: Option<Regex>,
    include_user_agent: Option<Regex>,
    exclude_user_agent: Option<Regex>,
}

impl RequestMatcher {
    /// Compile the configured rules. Fails fast on a malformed regex or an
    /// unknown `default` value.
    pub fn new(rules: &MatchRules) -> anyhow::Result<Self> {
        let default_skip = match rules.default.as_deref() {
            None | Some("include") => false,
            Some("exclude") => true,
            Some(other) => anyhow::bail!("invalid default value '{}'", other),
        };

        let compile = |pattern: &Option<String>| -> anyhow::Result<Option<Regex>> {
            match pattern {
                Some(p) => Ok(Some(Regex::new(p)?)),
                None => Ok(None),
            }
        };

        Ok(Self {
            default_skip,
            include_path: compile(&rules.include_path_regex)?,
            exclude_path: compile(&rules.exclude_path_regex)?,
            include_user_agent: compile(&rules.include_user_agent_regex)?,
            exclude_user_agent: compile(&rules.exclude_user_agent_regex)?,
        })
    }

    /// A matcher with no rules and the `include` default: never skips.
    pub fn match_all() -> Self {
        Self {
            default_skip: false,
            include_path: None,
            exclude_path: None,
            include_user_agent: None,
            exclude_user_agent: None,
        }
    }

    /// Whether the owning middleware should skip this request.
    /// First matching rule wins.
    pub fn should_skip(&self, path: &str, user_agent: &str) -> bool {
        if let Some(re) = &self.exclude_path {
            if re.is_match(path) {
                return true;
            }
        }
        if let Some(re) = &self.exclude_user_agent {
            if re.is_match(user_agent) {
                return true;
            }
        }
        if let Some(re) = &self.include_path {
            if re.is_match(path) {
                return false;
            }
        }
        if let Some(re) = &self.include_user_agent {
            if re.is_match(user_agent) {
                return false;
            }
        }
        self.default_skip
    }
}
