use std::fmt;
use std::str::FromStr;

use crate::EaselError;

/// Sampling algorithm requested for one generation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SchedulerChoice {
    Ddim,
    Ddpm,
    Pndm,
    Lms,
    EulerDiscrete,
    EulerAncestralDiscrete,
    DpmSolverMultistep,
    UniPc,
    FlowMatchEuler,
    FlowMatchEulerShifted,
}

impl SchedulerChoice {
    pub const ALL: [SchedulerChoice; 10] = [
        Self::Ddim,
        Self::Ddpm,
        Self::Pndm,
        Self::Lms,
        Self::EulerDiscrete,
        Self::EulerAncestralDiscrete,
        Self::DpmSolverMultistep,
        Self::UniPc,
        Self::FlowMatchEuler,
        Self::FlowMatchEulerShifted,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Ddim => "DDIM",
            Self::Ddpm => "DDPM",
            Self::Pndm => "PNDM",
            Self::Lms => "LMSDiscrete",
            Self::EulerDiscrete => "EulerDiscrete",
            Self::EulerAncestralDiscrete => "EulerAncestralDiscrete",
            Self::DpmSolverMultistep => "DPMSolverMultistep",
            Self::UniPc => "UniPCMultistep",
            Self::FlowMatchEuler => "FlowMatchEuler",
            Self::FlowMatchEulerShifted => "FlowMatchEulerShifted",
        }
    }

    /// Whether the sampler integrates a flow-matching velocity field rather
    /// than a noise-prediction objective.
    pub fn is_flow_matching(&self) -> bool {
        matches!(self, Self::FlowMatchEuler | Self::FlowMatchEulerShifted)
    }

    fn aliases(&self) -> &'static [&'static str] {
        match self {
            Self::Ddim => &["ddim"],
            Self::Ddpm => &["ddpm"],
            Self::Pndm => &["pndm"],
            Self::Lms => &["lms", "lmsdiscrete"],
            Self::EulerDiscrete => &["euler", "eulerdiscrete"],
            Self::EulerAncestralDiscrete => &["eulera", "eulerancestral", "eulerancestraldiscrete"],
            Self::DpmSolverMultistep => &["dpm", "dpm++", "dpmsolver", "dpmsolvermultistep", "dpm++2m"],
            Self::UniPc => &["unipc", "unipcmultistep"],
            Self::FlowMatchEuler => &["flowmatch", "flowmatcheuler", "flowmatcheulerdiscrete"],
            Self::FlowMatchEulerShifted => &["flowmatchshifted", "flowmatcheulershifted"],
        }
    }
}

impl fmt::Display for SchedulerChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SchedulerChoice {
    type Err = EaselError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .chars()
            .filter(|c| !matches!(c, '-' | '_' | ' '))
            .flat_map(char::to_lowercase)
            .collect();
        let normalized = normalized.strip_suffix("scheduler").unwrap_or(normalized.as_str());
        Self::ALL
            .into_iter()
            .find(|choice| choice.aliases().contains(&normalized))
            .ok_or_else(|| EaselError::InvalidInput(format!("unknown scheduler '{s}'")))
    }
}

serde_plain::derive_serialize_from_display!(SchedulerChoice);
serde_plain::derive_deserialize_from_fromstr!(SchedulerChoice, "a scheduler name");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_loose_names() {
        assert_eq!("euler_a".parse::<SchedulerChoice>().unwrap(), SchedulerChoice::EulerAncestralDiscrete);
        assert_eq!(
            "DPMSolverMultistepScheduler".parse::<SchedulerChoice>().unwrap(),
            SchedulerChoice::DpmSolverMultistep
        );
        assert_eq!("Flow-Match Euler".parse::<SchedulerChoice>().unwrap(), SchedulerChoice::FlowMatchEuler);
        assert!("heun".parse::<SchedulerChoice>().is_err());
    }

    #[test]
    fn display_name_parses_back() {
        for choice in SchedulerChoice::ALL {
            assert_eq!(choice.name().parse::<SchedulerChoice>().unwrap(), choice);
        }
    }
}
