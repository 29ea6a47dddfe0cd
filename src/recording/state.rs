use serde::{Deserialize, Serialize};

/// Record/playback transport states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TransportState {
    #[default]
    Stopped,
    Recording,
    Playing,
    Paused,
}

impl TransportState {
    /// Check if transition from current state to target state is valid
    pub fn can_transition_to(&self, target: TransportState) -> bool {
        use TransportState::*;

        matches!(
            (self, target),
            (Stopped, Recording) |
            (Stopped, Playing) |

            (Recording, Stopped) |

            (Playing, Paused) |
            (Playing, Stopped) |
            // loop restart
            (Playing, Playing) |

            (Paused, Playing) |
            (Paused, Stopped)
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Stopped => "Stopped",
            Self::Recording => "Recording",
            Self::Playing => "Playing",
            Self::Paused => "Paused",
        }
    }
}
