//! Virtual channel names and routing modes.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::message::{Message, MessageCategory};

/// One of the five virtual channels a transport carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChannelName {
    Default,
    IntentRequest,
    IntentResponse,
    Notice,
    Proposal,
}

impl ChannelName {
    pub const ALL: [ChannelName; 5] = [
        ChannelName::Default,
        ChannelName::IntentRequest,
        ChannelName::IntentResponse,
        ChannelName::Notice,
        ChannelName::Proposal,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::IntentRequest => "intentRequest",
            Self::IntentResponse => "intentResponse",
            Self::Notice => "notice",
            Self::Proposal => "proposal",
        }
    }

    /// Channel used for a category in multi-channel mode.
    pub fn for_category(category: MessageCategory) -> Self {
        match category {
            MessageCategory::IntentRequest | MessageCategory::Intent => Self::IntentRequest,
            MessageCategory::IntentResponse => Self::IntentResponse,
            MessageCategory::Notice => Self::Notice,
            MessageCategory::Proposal => Self::Proposal,
        }
    }
}

impl fmt::Display for ChannelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown channel name: {0}")]
pub struct UnknownChannel(pub String);

impl FromStr for ChannelName {
    type Err = UnknownChannel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| UnknownChannel(s.to_string()))
    }
}

/// Whether messages share one channel or are split by category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChannelMode {
    #[default]
    SingleChannel,
    MultiChannel,
}

impl ChannelMode {
    pub fn from_multi_channel(enabled: bool) -> Self {
        if enabled {
            Self::MultiChannel
        } else {
            Self::SingleChannel
        }
    }

    pub fn is_multi_channel(&self) -> bool {
        matches!(self, Self::MultiChannel)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SingleChannel => "single-channel",
            Self::MultiChannel => "multi-channel",
        }
    }

    /// Channels a subscription must attach to in this mode.
    pub fn channels(&self) -> &'static [ChannelName] {
        const SINGLE: [ChannelName; 1] = [ChannelName::Default];
        match self {
            Self::SingleChannel => &SINGLE,
            Self::MultiChannel => &ChannelName::ALL,
        }
    }

    /// Channel a message is sent on in this mode.
    pub fn select(&self, message: &Message) -> ChannelName {
        match self {
            Self::SingleChannel => ChannelName::Default,
            Self::MultiChannel => ChannelName::for_category(message.category()),
        }
    }
}

impl fmt::Display for ChannelMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
