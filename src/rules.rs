//! Window-matching rules.
//!
//! The rule language proper is an external concern; the compositor only
//! consults rule lists as opaque predicates. What lives here is the minimal
//! evaluator: a condition is `target[~=]pattern` where target is one of
//! `name`, `class`, `instance`, `role`, `type`, `id`; `=` matches exactly and
//! `~=` matches a substring. Opacity rules prefix a percentage: `85:class=X`.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::win::Window;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Name,
    Class,
    Instance,
    Role,
    Type,
    Id,
}

#[derive(Debug, Clone)]
struct Condition {
    target: Target,
    substring: bool,
    pattern: String,
}

impl Condition {
    fn parse(s: &str) -> Option<Self> {
        let (lhs, substring, pattern) = if let Some((l, r)) = s.split_once("~=") {
            (l, true, r)
        } else if let Some((l, r)) = s.split_once('=') {
            (l, false, r)
        } else {
            return None;
        };
        let target = match lhs.trim() {
            "name" => Target::Name,
            "class" => Target::Class,
            "instance" => Target::Instance,
            "role" => Target::Role,
            "type" => Target::Type,
            "id" => Target::Id,
            _ => return None,
        };
        Some(Self {
            target,
            substring,
            pattern: pattern.trim().to_owned(),
        })
    }

    fn matches(&self, w: &Window) -> bool {
        let value: std::borrow::Cow<str> = match self.target {
            Target::Name => (&*w.name).into(),
            Target::Class => (&*w.class_general).into(),
            Target::Instance => (&*w.class_instance).into(),
            Target::Role => (&*w.role).into(),
            Target::Type => w.wintype.name().into(),
            Target::Id => format!("{:#010x}", w.id).into(),
        };
        if self.substring {
            value.contains(&self.pattern)
        } else {
            *value == self.pattern
        }
    }
}

/// A list of conditions; matching any one condition matches the list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleList {
    raw: Vec<String>,
    #[serde(skip)]
    compiled: std::cell::OnceCell<Vec<Condition>>,
}

impl RuleList {
    pub fn new(raw: Vec<String>) -> Self {
        Self { raw, compiled: Default::default() }
    }

    fn compiled(&self) -> &[Condition] {
        self.compiled.get_or_init(|| {
            self.raw
                .iter()
                .filter_map(|s| {
                    let c = Condition::parse(s);
                    if c.is_none() {
                        warn!("Ignoring malformed rule {:?}", s);
                    }
                    c
                })
                .collect()
        })
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    pub fn matches(&self, w: &Window) -> bool {
        self.compiled().iter().any(|c| c.matches(w))
    }
}

/// Value rules: `NN:condition` assigns opacity `NN / 100` to matching
/// windows. First match wins.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OpacityRules {
    raw: Vec<String>,
    #[serde(skip)]
    compiled: std::cell::OnceCell<Vec<(f64, Condition)>>,
}

impl OpacityRules {
    pub fn new(raw: Vec<String>) -> Self {
        Self { raw, compiled: Default::default() }
    }

    fn compiled(&self) -> &[(f64, Condition)] {
        self.compiled.get_or_init(|| {
            self.raw
                .iter()
                .filter_map(|s| {
                    let parsed = s.split_once(':').and_then(|(pct, cond)| {
                        let pct: f64 = pct.trim().parse().ok()?;
                        if !(0.0..=100.0).contains(&pct) {
                            return None;
                        }
                        Some((pct / 100.0, Condition::parse(cond)?))
                    });
                    if parsed.is_none() {
                        warn!("Ignoring malformed opacity rule {:?}", s);
                    }
                    parsed
                })
                .collect()
        })
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    pub fn match_value(&self, w: &Window) -> Option<f64> {
        self.compiled()
            .iter()
            .find(|(_, c)| c.matches(w))
            .map(|(v, _)| *v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::win::{WinType, Window};

    fn sample_win() -> Window {
        let mut w = Window::new(0x1400005, Default::default());
        w.name = "scratchpad".into();
        w.class_general = "URxvt".into();
        w.class_instance = "urxvt".into();
        w.role = "browser".into();
        w.wintype = WinType::Dock;
        w
    }

    #[test]
    fn exact_and_substring_conditions() {
        let w = sample_win();
        assert!(RuleList::new(vec!["class=URxvt".into()]).matches(&w));
        assert!(!RuleList::new(vec!["class=urxvt".into()]).matches(&w));
        assert!(RuleList::new(vec!["name~=scratch".into()]).matches(&w));
        assert!(RuleList::new(vec!["type=dock".into()]).matches(&w));
        assert!(RuleList::new(vec!["id=0x01400005".into()]).matches(&w));
    }

    #[test]
    fn malformed_rules_never_match() {
        let w = sample_win();
        let rl = RuleList::new(vec!["garbage".into(), "bogus-target=x".into()]);
        assert!(!rl.matches(&w));
    }

    #[test]
    fn opacity_rules_first_match_wins() {
        let w = sample_win();
        let rules = OpacityRules::new(vec![
            "120:class=URxvt".into(), // out of range, dropped
            "85:class=URxvt".into(),
            "40:name~=scratch".into(),
        ]);
        assert_eq!(rules.match_value(&w), Some(0.85));
        let miss = sample_win();
        let rules = OpacityRules::new(vec!["85:class=Firefox".into()]);
        assert_eq!(rules.match_value(&miss), None);
    }
}
