/// Deterministic progress is measured in "ticks": retired conditional
/// branches counted by the PMU. See `perf_counters` for how these are
/// gathered.
pub type Ticks = u64;
