use std::env;
use std::sync::OnceLock;

static FUSERS_DUMP_KERNEL: OnceLock<bool> = OnceLock::new();
static FUSERS_DUMP_FUSION: OnceLock<bool> = OnceLock::new();

fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

fn read_flag(name: &str) -> bool {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => parse_bool(&value),
        _ => false,
    }
}

pub(crate) fn dump_kernel_enabled() -> bool {
    *FUSERS_DUMP_KERNEL.get_or_init(|| read_flag("FUSERS_DUMP_KERNEL"))
}

pub(crate) fn dump_fusion_enabled() -> bool {
    *FUSERS_DUMP_FUSION.get_or_init(|| read_flag("FUSERS_DUMP_FUSION"))
}

/// Snapshot of the environment-driven debug switches.
///
/// Lowering consults the process-wide values unless a caller passes an
/// explicit `Config` through [`KernelOptions`](crate::lower::KernelOptions).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Config {
    pub dump_kernel: bool,
    pub dump_fusion: bool,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            dump_kernel: dump_kernel_enabled(),
            dump_fusion: dump_fusion_enabled(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::parse_bool;

    #[test]
    fn parse_bool_accepts_common_spellings() {
        for value in ["1", "true", "YES", " on "] {
            assert!(parse_bool(value), "{value:?} should enable the flag");
        }
        for value in ["0", "false", "off", "maybe"] {
            assert!(!parse_bool(value), "{value:?} should not enable the flag");
        }
    }
}
