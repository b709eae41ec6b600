use bitflags::bitflags;
use thiserror::Error;

bitflags! {
    /// Modification actions the filter is allowed to request at
    /// end-of-message (SMFIF_* bits of the negotiate packet).
    pub struct ActionFlags: u32 {
        const ADD_HEADERS = 0x0001;
        const CHANGE_BODY = 0x0002;
        const ADD_RECIPIENT = 0x0004;
        const REMOVE_RECIPIENT = 0x0008;
        const CHANGE_HEADERS = 0x0010;
        const QUARANTINE = 0x0020;
        const CHANGE_FROM = 0x0040;
        const ADD_RECIPIENT_WITH_ARGS = 0x0080;
        const SET_SYMBOL_LIST = 0x0100;
    }
}

bitflags! {
    /// Step bits of the negotiate packet (SMFIP_*).
    ///
    /// Bits set by the filter ask the MTA to omit a stage (`NO_*`), to not
    /// await a reply for a stage (`NR_*`), or tune stage behavior.
    pub struct StepFlags: u32 {
        const NO_CONNECT = 0x0000_0001;
        const NO_HELO = 0x0000_0002;
        const NO_MAIL = 0x0000_0004;
        const NO_RECIPIENT = 0x0000_0008;
        const NO_BODY = 0x0000_0010;
        const NO_HEADERS = 0x0000_0020;
        const NO_END_OF_HEADER = 0x0000_0040;
        const NR_HEADER = 0x0000_0080;
        const NO_UNKNOWN = 0x0000_0100;
        const NO_DATA = 0x0000_0200;
        /// MTA understands the skip reply.
        const SKIP = 0x0000_0400;
        /// MTA should also send rejected recipients.
        const REJECTED_RECIPIENTS = 0x0000_0800;
        const NR_CONNECT = 0x0000_1000;
        const NR_HELO = 0x0000_2000;
        const NR_MAIL = 0x0000_4000;
        const NR_RECIPIENT = 0x0000_8000;
        const NR_DATA = 0x0001_0000;
        const NR_UNKNOWN = 0x0002_0000;
        const NR_END_OF_HEADER = 0x0004_0000;
        const NR_BODY = 0x0008_0000;
        /// Header values are passed with their leading space.
        const HEADER_LEADING_SPACE = 0x0010_0000;
    }
}

/// The capability vector negotiated between MTA and filter: protocol
/// version, permitted modification actions and step tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptionSet {
    pub version: u32,
    pub actions: ActionFlags,
    pub steps: StepFlags,
}

/// Raised when the offered option set has no overlap with what this
/// implementation supports.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("MTA offered protocol version {offered}, supported are {min}..={max}")]
    UnsupportedVersion { offered: u32, min: u32, max: u32 },
}

impl OptionSet {
    /// Lowest milter protocol version this crate accepts.
    pub const MIN_VERSION: u32 = 2;
    /// Highest milter protocol version this crate speaks.
    pub const MAX_VERSION: u32 = 6;

    /// The option set offered to an MTA before any handler adjustment:
    /// newest version, every action, no step suppressed.
    pub fn supported() -> Self {
        Self {
            version: Self::MAX_VERSION,
            actions: ActionFlags::all(),
            steps: StepFlags::empty(),
        }
    }

    /// Intersect this filter-side option set with the MTA's offer.
    ///
    /// The version becomes the smaller of the two; versions below
    /// [`MIN_VERSION`](Self::MIN_VERSION) have no overlap with the
    /// supported set and fail. Action and step bits may only keep what
    /// the offer contains.
    pub fn intersect(&self, offered: &OptionSet) -> Result<OptionSet, NegotiationError> {
        if offered.version < Self::MIN_VERSION {
            return Err(NegotiationError::UnsupportedVersion {
                offered: offered.version,
                min: Self::MIN_VERSION,
                max: Self::MAX_VERSION,
            });
        }

        Ok(OptionSet {
            version: self.version.min(offered.version),
            actions: self.actions & offered.actions,
            steps: self.steps & offered.steps,
        })
    }

    /// Clamp `self` so it never claims bits the offer did not contain.
    /// Applied after the negotiate handler had its chance to adjust.
    pub(crate) fn clamp_to(&mut self, offered: &OptionSet) {
        if self.version > offered.version {
            self.version = offered.version;
        }
        self.actions &= offered.actions;
        self.steps &= offered.steps;
    }

    /// Whether the reply for `stage_bit` was negotiated away (`NR_*`).
    pub(crate) fn suppresses_reply(&self, no_reply_bit: StepFlags) -> bool {
        self.steps.contains(no_reply_bit)
    }
}

impl Default for OptionSet {
    fn default() -> Self {
        Self::supported()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn offer(version: u32, actions: u32, steps: u32) -> OptionSet {
        OptionSet {
            version,
            actions: ActionFlags::from_bits_truncate(actions),
            steps: StepFlags::from_bits_truncate(steps),
        }
    }

    #[test]
    fn intersect_keeps_offered_action_bits_only() {
        let offered = offer(6, 0x0004, 0);
        let ours = OptionSet::supported();

        let merged = ours.intersect(&offered).unwrap();

        assert_eq!(merged.version, 6);
        assert_eq!(merged.actions, ActionFlags::ADD_RECIPIENT);
        assert_eq!(merged.steps, StepFlags::empty());
    }

    #[test]
    fn intersect_takes_lower_version() {
        let offered = offer(4, 0x3f, 0);

        let merged = OptionSet::supported().intersect(&offered).unwrap();

        assert_eq!(merged.version, 4);
    }

    #[test]
    fn intersect_rejects_prehistoric_version() {
        let offered = offer(1, 0x3f, 0);

        let err = OptionSet::supported().intersect(&offered).unwrap_err();

        assert_eq!(
            err,
            NegotiationError::UnsupportedVersion {
                offered: 1,
                min: 2,
                max: 6
            }
        );
    }

    #[test]
    fn clamp_clears_bits_the_mta_did_not_offer() {
        let offered = offer(6, 0x0001, 0x0400);
        let mut adjusted = offer(6, 0x0021, 0x0410);

        adjusted.clamp_to(&offered);

        assert_eq!(adjusted.actions, ActionFlags::ADD_HEADERS);
        assert_eq!(adjusted.steps, StepFlags::SKIP);
    }
}
