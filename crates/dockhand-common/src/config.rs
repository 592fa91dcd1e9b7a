use serde::{Deserialize, Serialize};

/// Per-environment vulnerability gate applied to a candidate image before an
/// auto-update is allowed to proceed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GatePolicy {
    /// Update regardless of findings.
    #[default]
    None,
    /// Block if the candidate has any finding at all.
    AnyFound,
    /// Block if the candidate's severity profile is worse than the
    /// currently running image's.
    MoreThanCurrent,
}

/// Global scanner selection and default CLI arguments. `{image}` in an
/// argument is substituted with the image reference being scanned.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScannerSettings {
    /// Which scanner the installation runs; `None` disables scanning.
    pub kind: Option<String>,
    pub default_args: Vec<String>,
}

impl ScannerSettings {
    pub fn enabled(&self) -> bool {
        self.kind.is_some()
    }

    pub fn render_args(&self, image: &str) -> Vec<String> {
        self.default_args
            .iter()
            .map(|arg| arg.replace("{image}", image))
            .collect()
    }
}
