#![expect(
    clippy::module_name_repetitions,
    reason = "SessionInvalidator names what it invalidates when used outside this module"
)]

use async_trait::async_trait;

/// Reacts to the server forcing the current session out.
///
/// By the time [`SessionInvalidator::invalidate`] runs the socket has already been closed
/// and automatic reconnection disabled. Implementations typically clear the stored
/// credential, wait for the user to acknowledge, then navigate to a login location. The
/// client runs this on its own task, so awaiting user input here never stalls the socket.
#[async_trait]
pub trait SessionInvalidator: Send + Sync + 'static {
    async fn invalidate(&self);
}
