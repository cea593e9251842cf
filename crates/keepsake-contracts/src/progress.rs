use crate::tasks::TaskStatus;

/// One discrete step of either pipeline mode. Each stage owns a fixed
/// percentage band; intra-stage progress interpolates inside it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Analyzing,
    ApplyingStyle,
    GeneratingLogo,
    CreatingCard,
    Persisting,
}

impl Stage {
    /// Wire status reported while this stage runs. Persisting happens under
    /// the card-creation umbrella; there is no separate status for it.
    pub fn status(self) -> TaskStatus {
        match self {
            Stage::Analyzing => TaskStatus::Analyzing,
            Stage::ApplyingStyle => TaskStatus::ApplyingStyle,
            Stage::GeneratingLogo => TaskStatus::GeneratingLogo,
            Stage::CreatingCard | Stage::Persisting => TaskStatus::CreatingCard,
        }
    }

    fn bounds(self) -> (u8, u8) {
        match self {
            Stage::Analyzing => (5, 25),
            Stage::ApplyingStyle => (25, 90),
            Stage::GeneratingLogo => (25, 55),
            Stage::CreatingCard => (55, 90),
            Stage::Persisting => (90, 100),
        }
    }
}

/// Maps (stage, intra-stage fraction) to a reported percentage.
///
/// The fraction is clamped to [0, 1] and the output is bounded to [0, 100].
/// Stage bands do not overlap within one mode, so walking stages in order
/// with non-decreasing fractions yields a monotone progress sequence.
pub fn progress_at(stage: Stage, fraction: f32) -> u8 {
    let (start, end) = stage.bounds();
    let clamped = if fraction.is_finite() {
        fraction.clamp(0.0, 1.0)
    } else {
        0.0
    };
    let span = f32::from(end - start);
    let value = f32::from(start) + span * clamped;
    (value.round() as u8).min(100)
}
