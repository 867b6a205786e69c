//! Per-operation option overrides and the internal options pool.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::codec::{CodecType, CustomCodec};
use crate::entry::Expiration;

/// Expiration applied when the loader errors but still returned a
/// full-length result set.
const DEFAULT_ON_ERR_EXPIRATION: Duration = Duration::from_secs(3);

const POOL_CAPACITY: usize = 64;

/// Strategy for keys absent from the cache in `get_many` receivers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum NonExistKeyStrategy {
    /// Leave `None` at the key in the receiver map.
    #[default]
    FillNil,
    /// Remove the key from the receiver map.
    RemoveKey,
}

/// Per-call overrides for cache operations.
///
/// Unset fields fall back to the operation defaults. Build with the fluent
/// methods:
///
/// ```ignore
/// let opts = OpOptions::new()
///     .soft_expiration(Duration::from_secs(10))
///     .codec_type(CodecType::Json);
/// cache.set("key", &value, Expiration::secs(60), opts).await?;
/// ```
#[derive(Clone, Default)]
pub struct OpOptions {
    pub(crate) skip_codec: bool,
    pub(crate) skip_encoding: bool,
    pub(crate) wait_drain: bool,
    pub(crate) no_reply: Option<bool>,
    pub(crate) init_non_exist_key: Option<bool>,
    pub(crate) non_exist_key_strategy: Option<NonExistKeyStrategy>,
    pub(crate) soft_expiration: Option<Duration>,
    pub(crate) on_err_expiration: Option<Duration>,
    pub(crate) expiration_map: Option<HashMap<String, Expiration>>,
    pub(crate) codec_type: Option<CodecType>,
    pub(crate) custom_codec: Option<Arc<dyn CustomCodec>>,
}

impl OpOptions {
    pub fn new() -> Self {
        OpOptions::default()
    }

    /// Skip marshal and unmarshal; the value is stored by reference.
    /// Applicable to typed-mode (in-memory) stores only. Recommended when
    /// data fetched from cache will not be modified.
    pub fn skip_codec(mut self) -> Self {
        self.skip_codec = true;
        self
    }

    /// Store raw bytes without the metadata envelope. Not allowed for
    /// `load`/`load_many`.
    pub fn skip_encoding(mut self) -> Self {
        self.skip_encoding = true;
        self
    }

    /// Ask the store to synchronously drain its write buffer so the write is
    /// visible to the next read.
    pub fn wait_drain(mut self) -> Self {
        self.wait_drain = true;
        self
    }

    /// Fire-and-forget hint for `set_many`/`delete_many` on stores that
    /// support it. Defaults to true.
    pub fn no_reply(mut self, no_reply: bool) -> Self {
        self.no_reply = Some(no_reply);
        self
    }

    /// When `increment`/`decrement` hits a non-existing key, create it with
    /// 0 instead of reporting a miss. Defaults to true.
    pub fn init_non_exist_key(mut self, init: bool) -> Self {
        self.init_non_exist_key = Some(init);
        self
    }

    /// Strategy for keys absent from the cache in `get_many` receivers.
    /// Defaults to [`NonExistKeyStrategy::FillNil`].
    pub fn non_exist_key_strategy(mut self, strategy: NonExistKeyStrategy) -> Self {
        self.non_exist_key_strategy = Some(strategy);
        self
    }

    /// Soft expiration for to-cache data. Takes effect only when smaller
    /// than the hard expiration. On `load`/`load_many`, a soft-expired entry
    /// is served and refreshed asynchronously.
    pub fn soft_expiration(mut self, soft: Duration) -> Self {
        self.soft_expiration = Some(soft);
        self
    }

    /// Expiration applied when the loader errors but returned a full-length
    /// result set. Defaults to 3 seconds.
    pub fn on_err_expiration(mut self, expiration: Duration) -> Self {
        self.on_err_expiration = Some(expiration);
        self
    }

    /// Per-key hard expirations with the highest priority, for
    /// `set_many`/`load_many`.
    pub fn expiration_map(mut self, map: HashMap<String, Expiration>) -> Self {
        self.expiration_map = Some(map);
        self
    }

    /// Codec for this call, overriding the cache default.
    pub fn codec_type(mut self, codec_type: CodecType) -> Self {
        self.codec_type = Some(codec_type);
        self
    }

    /// Caller-supplied codec for this call; overrides `codec_type`.
    pub fn custom_codec(mut self, codec: Arc<dyn CustomCodec>) -> Self {
        self.custom_codec = Some(codec);
        self
    }
}

/// Fully-resolved options an operation actually runs with.
#[derive(Clone)]
pub(crate) struct ResolvedOptions {
    pub no_reply: bool,
    pub init_non_exist_key: bool,
    pub skip_codec: bool,
    pub skip_encoding: bool,
    pub wait_drain: bool,
    pub non_exist_key_strategy: NonExistKeyStrategy,
    pub codec_type: CodecType,
    pub custom_codec: Option<Arc<dyn CustomCodec>>,
    pub soft_expiration: Option<Duration>,
    pub on_err_expiration: Duration,
    pub expiration_map: Option<HashMap<String, Expiration>>,
    /// Hard expiration resolved by the operation, not the caller.
    pub hard_expiration: Expiration,
    /// Absolute soft timestamp override; wins over `soft_expiration`.
    pub soft_timeout_ts: i64,
    /// Absolute hard timestamp override; wins over `hard_expiration`.
    pub hard_timeout_ts: i64,
}

impl ResolvedOptions {
    fn new() -> Self {
        let mut options = ResolvedOptions {
            no_reply: true,
            init_non_exist_key: true,
            skip_codec: false,
            skip_encoding: false,
            wait_drain: false,
            non_exist_key_strategy: NonExistKeyStrategy::FillNil,
            codec_type: CodecType::Unset,
            custom_codec: None,
            soft_expiration: None,
            on_err_expiration: DEFAULT_ON_ERR_EXPIRATION,
            expiration_map: None,
            hard_expiration: Expiration::Default,
            soft_timeout_ts: 0,
            hard_timeout_ts: 0,
        };
        options.reset();
        options
    }

    fn reset(&mut self) {
        self.no_reply = true;
        self.init_non_exist_key = true;
        self.skip_codec = false;
        self.skip_encoding = false;
        self.wait_drain = false;
        self.non_exist_key_strategy = NonExistKeyStrategy::FillNil;
        self.codec_type = CodecType::Unset;
        self.custom_codec = None;
        self.soft_expiration = None;
        self.on_err_expiration = DEFAULT_ON_ERR_EXPIRATION;
        self.expiration_map = None;
        self.hard_expiration = Expiration::Default;
        self.soft_timeout_ts = 0;
        self.hard_timeout_ts = 0;
    }

    fn apply(&mut self, overrides: &OpOptions) {
        if overrides.skip_codec {
            self.skip_codec = true;
        }
        if overrides.skip_encoding {
            self.skip_encoding = true;
        }
        if overrides.wait_drain {
            self.wait_drain = true;
        }
        if let Some(no_reply) = overrides.no_reply {
            self.no_reply = no_reply;
        }
        if let Some(init) = overrides.init_non_exist_key {
            self.init_non_exist_key = init;
        }
        if let Some(strategy) = overrides.non_exist_key_strategy {
            self.non_exist_key_strategy = strategy;
        }
        if let Some(soft) = overrides.soft_expiration {
            self.soft_expiration = Some(soft);
        }
        if let Some(on_err) = overrides.on_err_expiration {
            self.on_err_expiration = on_err;
        }
        if let Some(map) = &overrides.expiration_map {
            self.expiration_map = Some(map.clone());
        }
        if let Some(codec_type) = overrides.codec_type {
            self.codec_type = codec_type;
        }
        if let Some(codec) = &overrides.custom_codec {
            self.custom_codec = Some(Arc::clone(codec));
        }
    }
}

static OPTIONS_POOL: Mutex<Vec<Box<ResolvedOptions>>> = Mutex::new(Vec::new());

/// A pooled [`ResolvedOptions`], returned to the pool on drop.
///
/// No reference to the options may outlive the owning call; detached tasks
/// take a clone.
pub(crate) struct PooledOptions {
    inner: Option<Box<ResolvedOptions>>,
}

impl PooledOptions {
    /// Take an owned copy for work that outlives the call.
    pub fn to_owned(&self) -> ResolvedOptions {
        self.deref().clone()
    }
}

impl Deref for PooledOptions {
    type Target = ResolvedOptions;

    fn deref(&self) -> &ResolvedOptions {
        self.inner.as_deref().expect("options taken")
    }
}

impl DerefMut for PooledOptions {
    fn deref_mut(&mut self) -> &mut ResolvedOptions {
        self.inner.as_deref_mut().expect("options taken")
    }
}

impl Drop for PooledOptions {
    fn drop(&mut self) {
        if let Some(options) = self.inner.take() {
            let mut pool = OPTIONS_POOL.lock();
            if pool.len() < POOL_CAPACITY {
                pool.push(options);
            }
        }
    }
}

/// Draw an options record from the pool, reset it, and apply the caller's
/// overrides.
pub(crate) fn acquire_options(overrides: &OpOptions) -> PooledOptions {
    let mut options = OPTIONS_POOL
        .lock()
        .pop()
        .unwrap_or_else(|| Box::new(ResolvedOptions::new()));
    options.reset();
    options.apply(overrides);
    PooledOptions {
        inner: Some(options),
    }
}
