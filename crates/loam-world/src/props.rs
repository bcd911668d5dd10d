use serde::{Deserialize, Serialize};

/// Ticks per minute at the stock 50 ms tick period; mirrored here so the
/// default day cycle does not depend on the scheduler crate.
const TICK_MINUTE: u64 = 1200;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TerrainKind {
    Normal,
    Flat,
}

/// Persisted properties of a world: everything a fresh process needs to
/// reopen the same world and keep generating consistent terrain.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorldProps {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: TerrainKind,
    pub seed: i32,
    /// Day-time fraction in [0, 1).
    pub daytime: f64,
    /// Day length in ticks; 0 freezes the sun.
    pub daycycle: u64,
    pub spawn: [i32; 3],
}

impl Default for WorldProps {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            kind: TerrainKind::Normal,
            seed: 0,
            daytime: 0.0,
            daycycle: TICK_MINUTE * 20,
            spawn: [282, 242, 268],
        }
    }
}

impl WorldProps {
    /// The second stock world: a frozen-noon flat world.
    pub fn flatland() -> Self {
        Self {
            name: "flatland".to_string(),
            kind: TerrainKind::Flat,
            seed: 0,
            daycycle: 0,
            spawn: [272, 258, 272],
            ..Self::default()
        }
    }

    /// Advance the day-time fraction by one tick.
    pub fn advance_daytime(&mut self) {
        if self.daycycle > 0 {
            self.daytime = (self.daytime + 1.0 / self.daycycle as f64) % 1.0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toml_round_trip() {
        let props = WorldProps::flatland();
        let text = toml::to_string(&props).unwrap();
        let back: WorldProps = toml::from_str(&text).unwrap();
        assert_eq!(back, props);
    }

    #[test]
    fn kind_serializes_lowercase() {
        let text = toml::to_string(&WorldProps::default()).unwrap();
        assert!(text.contains("type = \"normal\""), "{text}");
    }

    #[test]
    fn daytime_wraps() {
        let mut props = WorldProps {
            daycycle: 4,
            daytime: 0.0,
            ..WorldProps::default()
        };
        for _ in 0..5 {
            props.advance_daytime();
        }
        assert!(props.daytime >= 0.0 && props.daytime < 1.0);
        assert!((props.daytime - 0.25).abs() < 1e-9);
    }

    #[test]
    fn frozen_daycycle_keeps_daytime() {
        let mut props = WorldProps::flatland();
        props.daytime = 0.5;
        props.advance_daytime();
        assert_eq!(props.daytime, 0.5);
    }
}
