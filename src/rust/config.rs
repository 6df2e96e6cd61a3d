// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    memory::{
        cache::LockPolicy,
        descriptor::MAX_OFFSET,
    },
    runtime::{
        fail::Fail,
        limits::{
            BUF_SIZE,
            DATA_HEADROOM,
            DEFAULT_THREAD_MAP,
            ETH_HLEN,
            MAX_PACKET_LEN,
            NB_BUFFERS,
            NUM_PORTS,
            NUM_WORKERS,
            RELEASE_BATCH,
            THRESHOLD_HIGH,
            VLEN,
        },
    },
};
use ::std::{
    fs,
    ops::Index,
    str::FromStr,
};
use ::yaml_rust::{
    Yaml,
    YamlLoader,
};

//======================================================================================================================
// Constants
//======================================================================================================================

// Device options.
mod device_config {
    pub const SECTION_NAME: &str = "meshbuf";
    pub const LOCK_POLICY: &str = "lock_policy";
    pub const CACHE_CAPACITY: &str = "cache_capacity";
    pub const THREAD_MAP: &str = "thread_map";
    pub const HIGH_WATERMARK: &str = "high_watermark";
    pub const RELEASE_BATCH: &str = "release_batch";
    pub const DATA_HEADROOM: &str = "data_headroom";
    pub const MAX_PACKET_LEN: &str = "max_packet_len";
    pub const SYNC_DEBUG: &str = "sync_debug";
    pub const TX_DEBUG: &str = "tx_debug";
    pub const RX_DEBUG: &str = "rx_debug";
}

/// Prefix of environment variables overriding configuration options.
const ENV_PREFIX: &str = "MESHBUF_";

//======================================================================================================================
// Structures
//======================================================================================================================

/// Configuration file.
#[derive(Clone, Debug)]
pub struct Config(pub Yaml);

/// Validated device settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceConfig {
    /// Locking of the per-worker descriptor caches.
    pub lock_policy: LockPolicy,
    /// Capacity of each descriptor cache. A power of two.
    pub cache_capacity: usize,
    /// Port to worker cache mapping.
    pub thread_map: [u8; NUM_PORTS],
    /// Cache occupancy above which descriptors are handed back on RECEIVE.
    pub high_watermark: usize,
    /// Descriptors handed back per RECEIVE.
    pub release_batch: usize,
    /// Intra-buffer offset given to free buffers.
    pub data_headroom: u16,
    /// Upper bound of an assembled injected packet.
    pub max_packet_len: usize,
    pub sync_debug: bool,
    pub tx_debug: bool,
    pub rx_debug: bool,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl Config {
    /// Reads a configuration file into a [Config] object.
    pub fn new(config_path: &str) -> Result<Self, Fail> {
        let config_s: String = match fs::read_to_string(config_path) {
            Ok(s) => s,
            Err(e) => {
                let cause: String = format!("failed to read configuration file (path={}): {}", config_path, e);
                error!("new(): {}", cause);
                return Err(Fail::new(libc::ENOENT, &cause));
            },
        };
        Self::from_yaml_str(&config_s)
    }

    /// Parses a configuration from a YAML string.
    pub fn from_yaml_str(config_s: &str) -> Result<Self, Fail> {
        let config: Vec<Yaml> = match YamlLoader::load_from_str(config_s) {
            Ok(config) => config,
            Err(e) => {
                let cause: String = format!("malformed configuration: {}", e);
                error!("from_yaml_str(): {}", cause);
                return Err(Fail::new(libc::EINVAL, &cause));
            },
        };
        let config_obj: &Yaml = match &config[..] {
            [c] => c,
            _ => return Err(Fail::new(libc::EINVAL, "Wrong number of config objects")),
        };

        Ok(Self(config_obj.clone()))
    }

    /// Device section. Absent sections read as empty.
    fn get_device_config(&self) -> Result<Option<&Yaml>, Fail> {
        if self.0.index(device_config::SECTION_NAME).is_badvalue() {
            return Ok(None);
        }
        Ok(Some(Self::get_subsection(&self.0, device_config::SECTION_NAME)?))
    }

    /// Reads an integer option from the environment first, then from the device section, then falls back to `default`.
    fn int_or<T: FromStr + TryFrom<i64>>(&self, index: &str, default: T) -> Result<T, Fail> {
        if let Some(value) = Self::get_typed_env_option(index)? {
            return Ok(value);
        }
        match self.get_device_config()? {
            Some(section) if !section.index(index).is_badvalue() => Self::get_int_option(section, index),
            _ => Ok(default),
        }
    }

    /// Reads a boolean option from the environment first, then from the device section, then falls back to `default`.
    fn bool_or(&self, index: &str, default: bool) -> Result<bool, Fail> {
        if let Some(value) = Self::get_typed_env_option(index)? {
            return Ok(value);
        }
        match self.get_device_config()? {
            Some(section) if !section.index(index).is_badvalue() => Self::get_bool_option(section, index),
            _ => Ok(default),
        }
    }

    pub fn lock_policy(&self) -> Result<LockPolicy, Fail> {
        if let Some(policy) = Self::get_typed_env_option(device_config::LOCK_POLICY)? {
            return Ok(policy);
        }
        match self.get_device_config()? {
            Some(section) if !section.index(device_config::LOCK_POLICY).is_badvalue() => {
                Self::get_typed_str_option(section, device_config::LOCK_POLICY, |s| LockPolicy::from_str(s).ok())
            },
            _ => Ok(LockPolicy::Interrupt),
        }
    }

    pub fn cache_capacity(&self) -> Result<usize, Fail> {
        self.int_or(device_config::CACHE_CAPACITY, NB_BUFFERS)
    }

    /// Reads the port to worker mapping, a list of one worker id per port. Cannot be passed as an environment variable.
    pub fn thread_map(&self) -> Result<[u8; NUM_PORTS], Fail> {
        let section: &Yaml = match self.get_device_config()? {
            Some(section) if !section.index(device_config::THREAD_MAP).is_badvalue() => section,
            _ => return Ok(DEFAULT_THREAD_MAP),
        };
        let entries: &Vec<Yaml> = Self::get_typed_option(section, device_config::THREAD_MAP, &Yaml::as_vec)?;
        if entries.len() != NUM_PORTS {
            let cause: String = format!("thread_map needs one entry per port (entries={})", entries.len());
            error!("thread_map(): {}", cause);
            return Err(Fail::new(libc::EINVAL, &cause));
        }
        let mut map: [u8; NUM_PORTS] = [0; NUM_PORTS];
        for (slot, entry) in map.iter_mut().zip(entries) {
            *slot = match entry.as_i64().map(u8::try_from) {
                Some(Ok(worker)) => worker,
                _ => return Err(Fail::new(libc::EINVAL, "thread_map entries must be worker ids")),
            };
        }
        Ok(map)
    }

    pub fn high_watermark(&self) -> Result<usize, Fail> {
        self.int_or(device_config::HIGH_WATERMARK, THRESHOLD_HIGH)
    }

    pub fn release_batch(&self) -> Result<usize, Fail> {
        self.int_or(device_config::RELEASE_BATCH, RELEASE_BATCH)
    }

    pub fn data_headroom(&self) -> Result<u16, Fail> {
        self.int_or(device_config::DATA_HEADROOM, DATA_HEADROOM)
    }

    pub fn max_packet_len(&self) -> Result<usize, Fail> {
        self.int_or(device_config::MAX_PACKET_LEN, MAX_PACKET_LEN)
    }

    pub fn sync_debug(&self) -> Result<bool, Fail> {
        self.bool_or(device_config::SYNC_DEBUG, false)
    }

    pub fn tx_debug(&self) -> Result<bool, Fail> {
        self.bool_or(device_config::TX_DEBUG, false)
    }

    pub fn rx_debug(&self) -> Result<bool, Fail> {
        self.bool_or(device_config::RX_DEBUG, false)
    }

    //==================================================================================================================
    // Static Functions
    //==================================================================================================================

    /// Similar to `get_typed_option` using `Yaml::as_hash` receiver. This method returns a `&Yaml` instead of
    /// yaml::Hash, and Yaml is more natural for indexing.
    fn get_subsection<'a>(yaml: &'a Yaml, index: &str) -> Result<&'a Yaml, Fail> {
        let section: &'a Yaml = Self::get_option(yaml, index)?;
        match section {
            Yaml::Hash(_) => Ok(section),
            _ => {
                let message: String = format!("parameter \"{}\" has unexpected type", index);
                Err(Fail::new(libc::EINVAL, message.as_str()))
            },
        }
    }

    /// Index `yaml` to find the value at `index`, validating that the index exists.
    fn get_option<'a>(yaml: &'a Yaml, index: &str) -> Result<&'a Yaml, Fail> {
        match yaml.index(index) {
            Yaml::BadValue => {
                let message: String = format!("missing configuration option \"{}\"", index);
                Err(Fail::new(libc::EINVAL, message.as_str()))
            },
            value => Ok(value),
        }
    }

    /// Index `yaml` to find the value at `index`, validating that it exists and that the receiver returns Some(_).
    fn get_typed_option<'a, T, Fn>(yaml: &'a Yaml, index: &str, receiver: Fn) -> Result<T, Fail>
    where
        Fn: FnOnce(&'a Yaml) -> Option<T>,
    {
        let option: &'a Yaml = Self::get_option(yaml, index)?;
        match receiver(option) {
            Some(value) => Ok(value),
            None => {
                let message: String = format!("parameter {} has unexpected type", index);
                Err(Fail::new(libc::EINVAL, message.as_str()))
            },
        }
    }

    /// Index `yaml` to find value at `index`, validating it as a string.
    fn get_typed_str_option<T, Fn>(yaml: &Yaml, index: &str, parser: Fn) -> Result<T, Fail>
    where
        Fn: FnOnce(&str) -> Option<T>,
    {
        let option: &Yaml = Self::get_option(yaml, index)?;
        if let Some(value) = option.as_str() {
            if let Some(value) = parser(value) {
                return Ok(value);
            }
        }
        let message: String = format!("parameter {} has unexpected value", index);
        Err(Fail::new(libc::EINVAL, message.as_str()))
    }

    /// Get value where the environment value overrides the config file if it exists.
    fn get_typed_env_option<T: FromStr>(index: &str) -> Result<Option<T>, Fail> {
        let name: String = format!("{}{}", ENV_PREFIX, index.to_uppercase());
        if let Ok(var) = ::std::env::var(&name) {
            if let Ok(value) = var.as_str().parse() {
                return Ok(Some(value));
            } else {
                let message: String = format!("environment variable {} has unexpected type", name);
                return Err(Fail::new(libc::EINVAL, message.as_str()));
            }
        }
        Ok(None)
    }

    /// Similar to `get_typed_option` using `Yaml::as_i64` as the receiver, but additionally verifies that the
    /// destination type may hold the i64 value.
    fn get_int_option<T: TryFrom<i64>>(yaml: &Yaml, index: &str) -> Result<T, Fail> {
        let val: i64 = Self::get_typed_option(yaml, index, &Yaml::as_i64)?;
        match T::try_from(val) {
            Ok(val) => Ok(val),
            _ => {
                let message: String = format!("parameter \"{}\" is out of range", index);
                Err(Fail::new(libc::ERANGE, message.as_str()))
            },
        }
    }

    /// Same as `Self::get_typed_option` using `Yaml::as_bool` as the receiver.
    fn get_bool_option(yaml: &Yaml, index: &str) -> Result<bool, Fail> {
        Self::get_typed_option(yaml, index, &Yaml::as_bool)
    }
}

impl DeviceConfig {
    /// Checks that every setting is usable by a device.
    pub fn validate(&self) -> Result<(), Fail> {
        let check = |ok: bool, cause: &str| -> Result<(), Fail> {
            if ok {
                Ok(())
            } else {
                error!("validate(): {}", cause);
                Err(Fail::new(libc::EINVAL, cause))
            }
        };
        check(
            self.cache_capacity.is_power_of_two() && self.cache_capacity <= u32::MAX as usize / 2 + 1,
            "cache capacity must be a power of two",
        )?;
        check(
            self.thread_map.iter().all(|w| (*w as usize) < NUM_WORKERS),
            "thread map refers to an unknown worker",
        )?;
        check(
            self.high_watermark < self.cache_capacity,
            "high watermark must be below the cache capacity",
        )?;
        check(
            self.release_batch > 0 && self.release_batch <= VLEN,
            "release batch must fit in a release vector",
        )?;
        check(
            self.data_headroom <= MAX_OFFSET && (self.data_headroom as usize) < BUF_SIZE,
            "data headroom must lie inside a buffer",
        )?;
        check(self.max_packet_len > ETH_HLEN, "max packet length too small")?;
        if self.lock_policy == LockPolicy::PollOnly && self.shares_caches() {
            warn!(
                "validate(): ports sharing a poll-only cache must be polled by one thread (thread_map={:?})",
                self.thread_map
            );
        }
        Ok(())
    }

    /// Does any descriptor cache serve more than one port?
    pub fn shares_caches(&self) -> bool {
        self.thread_map
            .iter()
            .enumerate()
            .any(|(port, worker)| self.thread_map[..port].contains(worker))
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            lock_policy: LockPolicy::Interrupt,
            cache_capacity: NB_BUFFERS,
            thread_map: DEFAULT_THREAD_MAP,
            high_watermark: THRESHOLD_HIGH,
            release_batch: RELEASE_BATCH,
            data_headroom: DATA_HEADROOM,
            max_packet_len: MAX_PACKET_LEN,
            sync_debug: false,
            tx_debug: false,
            rx_debug: false,
        }
    }
}

impl TryFrom<&Config> for DeviceConfig {
    type Error = Fail;

    fn try_from(config: &Config) -> Result<Self, Self::Error> {
        let device_config: DeviceConfig = DeviceConfig {
            lock_policy: config.lock_policy()?,
            cache_capacity: config.cache_capacity()?,
            thread_map: config.thread_map()?,
            high_watermark: config.high_watermark()?,
            release_batch: config.release_batch()?,
            data_headroom: config.data_headroom()?,
            max_packet_len: config.max_packet_len()?,
            sync_debug: config.sync_debug()?,
            tx_debug: config.tx_debug()?,
            rx_debug: config.rx_debug()?,
        };
        device_config.validate()?;
        Ok(device_config)
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
