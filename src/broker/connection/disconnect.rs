//! disconn handling

use tracing::debug;

use super::{Connection, State};
use crate::broker::engine::Retire;
use crate::transport::FrameIo;

impl<T: FrameIo> Connection<T> {
    /// Graceful leave: tear the session down and close the writer. The
    /// connection loop flushes what is queued and exits.
    pub(crate) async fn handle_disconnect(&mut self) {
        match std::mem::replace(&mut self.state, State::Disconnected) {
            State::Connected { client_id } => {
                debug!("Client {} disconnected", client_id);
                self.engine
                    .teardown(&client_id, &self.writer, Retire::Graceful)
                    .await;
            }
            _ => {
                debug!("disconn from unconnected {}", self.remote);
                self.writer.close();
            }
        }
    }
}
