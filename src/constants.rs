//! Crate wide constants

/// Maximum supported wavelet order.
pub const KMAX: usize = 30;

/// Default wavelet order.
pub const DEFAULT_K: usize = 7;

/// Default screening threshold.
pub const DEFAULT_THRESH: f64 = 1e-5;

/// Default level to which trees are initially refined before projection.
pub const DEFAULT_INITIAL_LEVEL: u8 = 2;

/// Refinement never proceeds below this level.
pub const DEFAULT_MAX_REFINE_LEVEL: u8 = 30;

/// Level below which the default process map hashes an ancestor instead of
/// the key itself, keeping deep subtrees co-located with their parents.
pub const PMAP_LOCALITY_LEVEL: u8 = 4;

/// Number of lock shards in the local partition of a node container.
pub const NBUCKET: usize = 128;

/// Message tag for eager active messages.
pub const RMI_TAG: u16 = 0xF0;

/// Message tag for the data leg of the huge-message rendezvous.
pub const RMI_HUGE_DAT_TAG: u16 = 0xF1;

/// Message tag for the acknowledgement leg of the huge-message rendezvous.
pub const RMI_HUGE_ACK_TAG: u16 = 0xF2;

/// Default size of each posted eager receive buffer in bytes.
pub const DEFAULT_MAX_MSG_LEN: usize = 3 * 512 * 1024;

/// Eager receive buffers are sized and allocated on this alignment.
pub const ALIGNMENT: usize = 64;

/// Default number of posted eager receive buffers, also the floor.
pub const DEFAULT_NRECV: usize = 2;

/// Environment variable overriding the eager buffer size; accepts a plain
/// byte count or a value with a `KB`, `MB` or `GB` suffix.
pub const ENV_BUFFER_SIZE: &str = "MW_BUFFER_SIZE";

/// Environment variable overriding the number of posted eager buffers.
pub const ENV_RECV_BUFFERS: &str = "MW_RECV_BUFFERS";

/// Environment variable overriding the number of compute worker threads.
pub const ENV_NUM_THREADS: &str = "MW_NUM_THREADS";

/// Decay factor for the per-key wallclock record kept by operator apply.
pub const APPLY_TIME_DECAY: f64 = 0.9;

/// Over-screening safety factor used when applying integral operators.
pub const APPLY_SCREEN_FAC: f64 = 3.0;

/// Sentinel marking a subtree norm that has not yet been computed.
pub const NORM_TREE_UNSET: f64 = 1e300;
