use std::env;

/// True when this process is itself being replayed by an outer instance of
/// the tool. The outer recorder exports this for its tracees; quirk probes
/// short-circuit on it because the emulated PMU is idealized.
pub fn running_under_retrace() -> bool {
    env::var_os("RUNNING_UNDER_RETRACE").is_some()
}
