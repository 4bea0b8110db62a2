use std::fmt;

/// Direction of a timed guide pulse.
///
/// `North`/`South` are the declination axis, `East`/`West` right ascension.
/// `None` means no direction has been recorded yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuideDirection {
    None,
    North,
    South,
    East,
    West,
}

impl GuideDirection {
    /// True for the declination directions.
    pub fn is_dec(self) -> bool {
        matches!(self, GuideDirection::North | GuideDirection::South)
    }

    /// The opposite direction on the same axis. `None` stays `None`.
    pub fn reversed(self) -> GuideDirection {
        match self {
            GuideDirection::None => GuideDirection::None,
            GuideDirection::North => GuideDirection::South,
            GuideDirection::South => GuideDirection::North,
            GuideDirection::East => GuideDirection::West,
            GuideDirection::West => GuideDirection::East,
        }
    }
}

impl fmt::Display for GuideDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GuideDirection::None => "None",
            GuideDirection::North => "North",
            GuideDirection::South => "South",
            GuideDirection::East => "East",
            GuideDirection::West => "West",
        };
        write!(f, "{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_dec() {
        assert!(GuideDirection::North.is_dec());
        assert!(GuideDirection::South.is_dec());
        assert!(!GuideDirection::East.is_dec());
        assert!(!GuideDirection::None.is_dec());
    }

    #[test]
    fn test_reversed() {
        assert_eq!(GuideDirection::North.reversed(), GuideDirection::South);
        assert_eq!(GuideDirection::West.reversed(), GuideDirection::East);
        assert_eq!(GuideDirection::None.reversed(), GuideDirection::None);
    }
}
