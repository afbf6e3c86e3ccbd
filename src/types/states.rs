use serde::Deserialize;

/// The state of a job as reported by `stats-job`.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Ready,
    Delayed,
    #[default]
    Reserved,
    Buried,
}
