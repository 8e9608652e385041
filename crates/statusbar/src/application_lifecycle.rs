//! Process shutdown. The signal handler cancels one process-wide token, and everything that runs
//! until exit (registries, discovery drivers, the command loop) holds a child of it.

use once_cell::sync::Lazy;
use tokio_util::sync::CancellationToken;

static EXIT: Lazy<CancellationToken> = Lazy::new(CancellationToken::new);

/// Ask every task to stop. Callable from any thread, including the signal handler's.
pub fn request_exit() {
    EXIT.cancel();
}

/// A token that is cancelled once the process is asked to exit. Cancelling it only stops its own
/// holders.
pub fn exit_token() -> CancellationToken {
    EXIT.child_token()
}

/// Select in a loop until `$token` is cancelled.
#[macro_export]
macro_rules! loop_select_exiting {
    ($token:expr; $($content:tt)*) => {
        loop {
            tokio::select! {
                _ = $token.cancelled() => break,
                $($content)*
            }
        }
    };
}
