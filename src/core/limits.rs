/*!
 * Agent Limits and Constants
 *
 * Centralized location for all limits, thresholds, and magic numbers.
 * Organized by component.
 */

use std::time::Duration;

// =============================================================================
// MULTIPLEXER
// =============================================================================

/// Maximum number of descriptors a single multiplexer state may watch
pub const IOMUX_MAX_POLLED_FDS: usize = 10;

// =============================================================================
// PROCESS REAPER
// =============================================================================

/// Default dead-child pool capacity
pub const DEFAULT_DEAD_CHILDREN: usize = 128;

/// Upper bound accepted from configuration
pub const MAX_DEAD_CHILDREN: usize = 4096;

/// Pause between escalation steps of kill-death
pub const KILL_DEATH_GRACE: Duration = Duration::from_millis(500);

/// Highest signal number tracked by the received-signal set
pub const MAX_TRACKED_SIGNAL: usize = 64;

// =============================================================================
// COMPOSITES
// =============================================================================

/// Receive buffer used by the flooder and echoer
pub const FLOODER_BUF_LEN: usize = 4096;

/// Per-fd echo queue bound (bytes); reads pause while a queue is full
pub const ECHOER_QUEUE_MAX_BYTES: usize = 1024 * 1024;

/// Wait used by the echoer when draining after the run time
pub const ECHOER_DRAIN_WAIT_MS: i32 = 1000;

/// Chunk written by overfill-buffers
pub const OVERFILL_CHUNK_LEN: usize = 4096;

/// Fill byte written by overfill-buffers
pub const OVERFILL_FILL_BYTE: u8 = 0xAD;

/// Consecutive rounds without progress that end overfill-buffers
pub const OVERFILL_STABLE_ROUNDS: u32 = 4;

/// Multiplexer wait per overfill round
pub const OVERFILL_WAIT_MS: i32 = 1000;

/// Socket-to-file copy buffer
pub const SOCK2FILE_BUF_LEN: usize = 4096;

/// Quiet period that ends a socket-to-file copy after its run time
pub const SOCK2FILE_DRAIN_WAIT_MS: i32 = 1000;

/// Receive buffer used by recv-verify
pub const RECV_VERIFY_BUF_LEN: usize = 1024;

/// Receive buffer used by simple-receiver (1MB)
pub const SIMPLE_RECEIVER_BUF_LEN: usize = 1024 * 1024;

/// Per-round wait of simple-receiver
pub const SIMPLE_RECEIVER_WAIT: Duration = Duration::from_secs(1);

/// Fill byte of simple-sender
pub const SIMPLE_SENDER_FILL_BYTE: u8 = b'A';

/// Fill byte of the flooder send buffer
pub const FLOODER_FILL_BYTE: u8 = b'X';

// =============================================================================
// BUFFERS
// =============================================================================

/// Pattern values at or above this fill buffers with random bytes
pub const BUF_PATTERN_RANDOM: u32 = 256;

/// Largest single buffer the agent will allocate on behalf of a client
pub const MAX_RPC_BUFFER_LEN: usize = 64 * 1024 * 1024;

// =============================================================================
// TRANSPORT
// =============================================================================

/// Maximum encoded frame (16MB)
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Default concurrent client connections
pub const DEFAULT_MAX_CONNECTIONS: usize = 64;

/// Socket directory name created under the temp dir
pub const DEFAULT_SOCKET_DIR_NAME: &str = "rpc-agent";

// =============================================================================
// OBSERVABILITY
// =============================================================================

/// Calls slower than this are logged at warn level
pub const SLOW_CALL_WARN_MS: u128 = 100;

// =============================================================================
// ENVIRONMENT
// =============================================================================

/// Environment variable carrying the library-under-test name
pub const DL_NAME_ENV: &str = "TARPC_DL_NAME";

/// Coverage hook exported by instrumented libraries
pub const COVERAGE_INIT_SYMBOL: &str = "__bb_init_connection";

/// Coverage connection string consumed by the hook
pub const COVERAGE_CONNECTION_ENV: &str = "TCE_CONNECTION";

/// Coverage peer id consumed by the hook
pub const COVERAGE_PEER_ENV: &str = "TCE_PEER";
