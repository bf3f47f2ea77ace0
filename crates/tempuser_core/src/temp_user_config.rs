//! Compiled view of the `[temp_user]` configuration block.
//!
//! Generator-side methods require `enabled`, matcher-side methods require
//! `known`. Calling either side while it is off is a caller bug and comes
//! back as [`TempUserError::Disabled`] or [`TempUserError::NotKnown`].

use crate::config::{SerialMappingConfig, SerialProviderConfig, TempUserSection};
use crate::error::TempUserError;
use crate::pattern::{LikeCondition, Pattern};

#[derive(Debug, Clone)]
pub struct RealTempUserConfig {
    enabled: bool,
    known: bool,
    actions: Vec<String>,
    gen_pattern: Option<Pattern>,
    match_patterns: Vec<Pattern>,
    reserved_pattern: Option<Pattern>,
    serial_provider: SerialProviderConfig,
    serial_mapping: SerialMappingConfig,
    expire_after_days: Option<u32>,
    notify_before_expiration_days: Option<u32>,
}

impl RealTempUserConfig {
    pub fn new(section: &TempUserSection) -> Result<Self, TempUserError> {
        let enabled = section.enabled;
        let known = enabled || section.known;

        let (gen_pattern, match_patterns, reserved_pattern) = if known {
            let gen_pattern = Pattern::new("genPattern", &section.gen_pattern)?;
            let match_patterns = match &section.match_pattern {
                Some(list) => list
                    .templates()
                    .into_iter()
                    .map(|template| Pattern::new("matchPattern", template))
                    .collect::<Result<Vec<_>, _>>()?,
                None => vec![gen_pattern.clone()],
            };
            let reserved_pattern = section
                .reserved_pattern
                .as_deref()
                .map(|template| Pattern::new("reservedPattern", template))
                .transpose()?;
            (Some(gen_pattern), match_patterns, reserved_pattern)
        } else {
            (None, Vec::new(), None)
        };

        Ok(Self {
            enabled,
            known,
            actions: section.actions.clone(),
            gen_pattern,
            match_patterns,
            reserved_pattern,
            serial_provider: section.serial_provider.clone(),
            serial_mapping: section.serial_mapping.clone(),
            expire_after_days: section.expire_after_days,
            notify_before_expiration_days: section.notify_before_expiration_days,
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Whether temp names are recognised. Stays on after creation is switched
    /// off so existing temp accounts keep being treated as such.
    pub fn is_known(&self) -> bool {
        self.known
    }

    pub fn is_auto_create_action(&self, action: &str) -> bool {
        if !self.enabled {
            return false;
        }
        let action = if action == "create" { "edit" } else { action };
        self.actions.iter().any(|allowed| allowed == action)
    }

    pub fn is_temp_name(&self, name: &str) -> bool {
        self.known && self.match_patterns.iter().any(|pattern| pattern.is_match(name))
    }

    /// Temp names plus anything matching `reservedPattern`; ordinary
    /// registration must refuse these.
    pub fn is_reserved_name(&self, name: &str) -> bool {
        if !self.known {
            return false;
        }
        self.is_temp_name(name)
            || self
                .reserved_pattern
                .as_ref()
                .is_some_and(|pattern| pattern.is_match(name))
    }

    /// A display name standing in for a temp account that does not exist yet.
    pub fn placeholder_name(&self, year: Option<i32>) -> Result<String, TempUserError> {
        let pattern = self.generator_pattern()?;
        let year = year
            .filter(|_| self.serial_provider.use_year)
            .map(|year| year.to_string());
        Ok(pattern.generate("*", year.as_deref()))
    }

    pub fn generator_pattern(&self) -> Result<&Pattern, TempUserError> {
        if !self.enabled {
            return Err(TempUserError::Disabled("temp account creation"));
        }
        self.gen_pattern
            .as_ref()
            .ok_or(TempUserError::Disabled("temp account creation"))
    }

    pub fn match_patterns(&self) -> Result<&[Pattern], TempUserError> {
        if !self.known {
            return Err(TempUserError::NotKnown("temp account naming"));
        }
        Ok(&self.match_patterns)
    }

    /// The first match pattern, for callers that only handle one.
    pub fn match_pattern(&self) -> Result<&Pattern, TempUserError> {
        self.match_patterns()?
            .first()
            .ok_or(TempUserError::NotKnown("temp account naming"))
    }

    /// `LIKE` conditions on `column`, one per match pattern, to be ORed.
    pub fn match_conditions(&self, column: &str) -> Result<Vec<LikeCondition>, TempUserError> {
        Ok(self
            .match_patterns()?
            .iter()
            .map(|pattern| pattern.like_condition(column))
            .collect())
    }

    pub fn reserved_pattern(&self) -> Option<&Pattern> {
        self.reserved_pattern.as_ref()
    }

    pub fn actions(&self) -> &[String] {
        &self.actions
    }

    pub fn serial_provider_config(&self) -> &SerialProviderConfig {
        &self.serial_provider
    }

    pub fn serial_mapping_config(&self) -> &SerialMappingConfig {
        &self.serial_mapping
    }

    pub fn use_year(&self) -> bool {
        self.serial_provider.use_year
    }

    pub fn expire_after_days(&self) -> Option<u32> {
        self.expire_after_days
    }

    /// `None` when expiry is off, since there is nothing to notify about.
    pub fn notify_before_expiration_days(&self) -> Option<u32> {
        self.expire_after_days
            .and(self.notify_before_expiration_days)
    }
}
