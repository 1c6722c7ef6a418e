//! Animation patterns.

use ledrig_hw::{Color, Command};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One command and how long to hold it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub command: Command,
    pub hold_ms: u64,
}

impl Step {
    pub fn new(command: Command, hold: Duration) -> Self {
        Self {
            command,
            hold_ms: hold.as_millis() as u64,
        }
    }

    pub fn hold(&self) -> Duration {
        Duration::from_millis(self.hold_ms)
    }
}

/// Named, ordered timing script of commands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pattern {
    pub name: String,
    #[serde(rename = "loop", default)]
    pub looping: bool,
    pub steps: Vec<Step>,
}

impl Pattern {
    pub fn new(name: impl Into<String>, steps: Vec<Step>, looping: bool) -> Self {
        Self {
            name: name.into(),
            looping,
            steps,
        }
    }

    /// Fills with `color`, then clears, `hz` times per second.
    pub fn blink(color: Color, hz: f64) -> Self {
        let half_period_ms = (500.0 / hz.max(0.01)).round().max(1.0) as u64;
        Self::new(
            format!("blink {} @ {}Hz", color, hz),
            vec![
                Step {
                    command: Command::Fill { color },
                    hold_ms: half_period_ms,
                },
                Step {
                    command: Command::Clear,
                    hold_ms: half_period_ms,
                },
            ],
            true,
        )
    }

    /// Walks one lit pixel along the first `len` pixels, once per color.
    ///
    /// Each pixel is switched off again before the next one lights up.
    pub fn chase(len: u8, colors: &[Color], hold: Duration) -> Self {
        let mut steps = Vec::with_capacity(len as usize * colors.len() * 2);
        for &color in colors {
            for index in 0..len {
                steps.push(Step::new(Command::SetPixel { index, color }, hold));
                steps.push(Step::new(
                    Command::SetPixel {
                        index,
                        color: Color::BLACK,
                    },
                    Duration::ZERO,
                ));
            }
        }
        Self::new(format!("chase x{}", len), steps, true)
    }

    /// Total time of one pass through the steps.
    pub fn duration(&self) -> Duration {
        self.steps.iter().map(Step::hold).sum()
    }
}
