use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use once_cell::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::accounts::{
    Audience, AuthManager, AutoCreateSource, CentralIdLookup, LocalAccountStore, User,
};
use crate::clock::{Clock, SystemClock};
use crate::config::ToolConfig;
use crate::error::TempUserError;
use crate::serial_mapping::{SerialMapping, SerialMappingRegistry};
use crate::serial_provider::{ProviderContext, SerialProvider, SerialProviderRegistry};
use crate::session::Session;
use crate::status::{
    CreateStatus, INTERNAL_ERROR, MessageParam, StatusMessage, THROTTLE_HIT, UNABLE_TO_ACQUIRE,
    USER_EXISTS,
};
use crate::temp_user_config::RealTempUserConfig;
use crate::throttle::{Throttler, WindowThrottler};

/// Session key holding a name reserved for the session's next edit.
pub const STASH_KEY: &str = "TempUser:name";

const THROTTLE_CALLER: &str = "TempUserCreator";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestContext {
    pub ip: Option<IpAddr>,
}

impl RequestContext {
    pub fn from_ip(ip: IpAddr) -> Self {
        Self { ip: Some(ip) }
    }
}

pub struct TempUserCreator {
    config: Arc<RealTempUserConfig>,
    providers: Arc<SerialProviderRegistry>,
    mappings: Arc<SerialMappingRegistry>,
    auth: Arc<dyn AuthManager>,
    central_ids: Arc<dyn CentralIdLookup>,
    account_throttler: Option<Arc<dyn Throttler>>,
    name_throttler: Option<Arc<dyn Throttler>>,
    clock: Arc<dyn Clock>,
    provider: OnceCell<Arc<dyn SerialProvider>>,
    mapping: OnceCell<Arc<dyn SerialMapping>>,
}

impl TempUserCreator {
    /// Provider and mapping are resolved from the registries on first use,
    /// so an unknown `type` only fails once a name is actually needed.
    pub fn new(
        config: Arc<RealTempUserConfig>,
        providers: Arc<SerialProviderRegistry>,
        mappings: Arc<SerialMappingRegistry>,
        auth: Arc<dyn AuthManager>,
        central_ids: Arc<dyn CentralIdLookup>,
    ) -> Self {
        Self {
            config,
            providers,
            mappings,
            auth,
            central_ids,
            account_throttler: None,
            name_throttler: None,
            clock: Arc::new(SystemClock),
            provider: OnceCell::new(),
            mapping: OnceCell::new(),
        }
    }

    /// A creator backed by the workspace database at `db_path`, with the
    /// built-in provider and mapping types and the configured throttles.
    pub fn local(db_path: &Path, config: &ToolConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let temp_user = RealTempUserConfig::new(&config.temp_user)?;
        let providers = SerialProviderRegistry::new(ProviderContext {
            db_path: db_path.to_path_buf(),
        });
        let accounts = Arc::new(LocalAccountStore::new(db_path, clock.clone()));
        let mut creator = Self::new(
            Arc::new(temp_user),
            Arc::new(providers),
            Arc::new(SerialMappingRegistry::new()),
            accounts.clone(),
            accounts,
        )
        .with_clock(clock.clone());

        if !config.throttle.account_creation.is_empty() {
            creator = creator.with_account_throttler(Arc::new(WindowThrottler::new(
                "acctcreate",
                config.throttle.account_creation.clone(),
                db_path,
                clock.clone(),
            )));
        }
        if !config.throttle.name_acquisition.is_empty() {
            creator = creator.with_name_throttler(Arc::new(WindowThrottler::new(
                "tempacctname",
                config.throttle.name_acquisition.clone(),
                db_path,
                clock,
            )));
        }
        Ok(creator)
    }

    /// Limits `create` calls per client IP.
    pub fn with_account_throttler(mut self, throttler: Arc<dyn Throttler>) -> Self {
        self.account_throttler = Some(throttler);
        self
    }

    /// Limits name acquisitions per client IP, including stashed ones.
    pub fn with_name_throttler(mut self, throttler: Arc<dyn Throttler>) -> Self {
        self.name_throttler = Some(throttler);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &RealTempUserConfig {
        &self.config
    }

    /// Create a temp account named `name`, or a freshly acquired name, and
    /// log it in. The returned status is the creation outcome.
    pub fn create(
        &self,
        name: Option<&str>,
        request: Option<&RequestContext>,
    ) -> Result<CreateStatus> {
        let ip = request.and_then(|request| request.ip);
        if request.is_some()
            && let Some(throttler) = &self.account_throttler
            && let Some(hit) = throttler.increase(None, ip, THROTTLE_CALLER)?
        {
            return Ok(CreateStatus::new_fatal(StatusMessage::with_params(
                THROTTLE_HIT,
                vec![
                    MessageParam::Num(u64::from(hit.count)),
                    MessageParam::Duration(hit.wait),
                ],
            )));
        }

        let name = match name {
            Some(name) => name.to_string(),
            None => match self.acquire_name(ip)? {
                Some(name) => name,
                None => return Ok(CreateStatus::new_fatal(StatusMessage::new(UNABLE_TO_ACQUIRE))),
            },
        };

        let status = self.attempt_auto_create(&name, false)?;
        if status.is_ok() {
            // The account exists now; this call only establishes the session.
            let login = self.attempt_auto_create(&name, true)?;
            debug!(name = %name, errors = login.errors.len(), "temp account logged in");
        }
        Ok(status)
    }

    /// Return the name stashed in `session`, acquiring and saving one first
    /// if there is none. `None` means acquisition failed and nothing was
    /// stashed.
    pub fn acquire_and_stash_name<S: Session + ?Sized>(&self, session: &mut S) -> Result<Option<String>> {
        if let Some(name) = session.get(STASH_KEY) {
            return Ok(Some(name));
        }
        let Some(name) = self.acquire_name(session.client_ip())? else {
            return Ok(None);
        };
        session.set(STASH_KEY, name.clone());
        session.save()?;
        debug!(session = session.id(), name = %name, "stashed temp name");
        Ok(Some(name))
    }

    pub fn stashed_name<S: Session + ?Sized>(&self, session: &S) -> Option<String> {
        session.get(STASH_KEY)
    }

    pub fn is_enabled(&self) -> bool {
        self.config.is_enabled()
    }

    pub fn is_known(&self) -> bool {
        self.config.is_known()
    }

    pub fn is_auto_create_action(&self, action: &str) -> bool {
        self.config.is_auto_create_action(action)
    }

    pub fn is_temp_name(&self, name: &str) -> bool {
        self.config.is_temp_name(name)
    }

    pub fn is_reserved_name(&self, name: &str) -> bool {
        self.config.is_reserved_name(name)
    }

    pub fn placeholder_name(&self) -> Result<String, TempUserError> {
        self.config.placeholder_name(Some(self.clock.year()))
    }

    fn attempt_auto_create(&self, name: &str, login: bool) -> Result<CreateStatus> {
        let Some(user) = User::new_from_name(name) else {
            return Ok(CreateStatus::new_fatal(StatusMessage::with_params(
                INTERNAL_ERROR,
                vec![MessageParam::Text(format!(
                    "Unable to create user object for temp name {name}"
                ))],
            )));
        };

        let created = self
            .auth
            .auto_create_user(&user, AutoCreateSource::Temp, login, true)?;
        let value = created.user.clone();
        let mut status = CreateStatus::good();
        status.merge(created);
        if status.has_message(USER_EXISTS) {
            status.fatal(StatusMessage::new(UNABLE_TO_ACQUIRE));
        }
        if status.is_ok() {
            status.user = value.or(Some(user));
        }
        Ok(status)
    }

    fn acquire_name(&self, ip: Option<IpAddr>) -> Result<Option<String>> {
        if let Some(throttler) = &self.name_throttler
            && let Some(hit) = throttler.increase(None, ip, THROTTLE_CALLER)?
        {
            info!(ip = ?ip, count = hit.count, wait = hit.wait, "temp name acquisition throttled");
            return Ok(None);
        }

        let pattern = self.config.generator_pattern()?;
        let year = self.config.use_year().then(|| self.clock.year());
        let index = self.serial_provider()?.acquire_index(year.unwrap_or(0))?;
        let serial_id = self.serial_mapping()?.serial_id_for_index(index);
        let year = year.map(|year| year.to_string());
        let name = pattern.generate(&serial_id, year.as_deref());

        if let Some(central_id) = self.central_ids.central_id_from_name(&name, Audience::Raw)? {
            warn!(name = %name, index, central_id, "generated temp name already exists");
            return Ok(None);
        }
        debug!(name = %name, index, "acquired temp name");
        Ok(Some(name))
    }

    fn serial_provider(&self) -> Result<&Arc<dyn SerialProvider>> {
        self.provider
            .get_or_try_init(|| self.providers.create(self.config.serial_provider_config()))
    }

    fn serial_mapping(&self) -> Result<&Arc<dyn SerialMapping>> {
        self.mapping
            .get_or_try_init(|| self.mappings.create(self.config.serial_mapping_config()))
    }
}
