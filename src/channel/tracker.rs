//! Ties a port's keep-alive ref and started state to listener interest on an emitter.

use crate::channel::port::MessagePort;
use crate::emitter::{Emitter, Event};

/// While `emitter` has at least one `name` listener, `port` is ref'd and
/// started; otherwise it is stopped and unref'd. The port starts unref'd.
///
/// Only a weak handle is kept, so tracking never extends the port's life.
pub fn track_interest<E: Event>(port: &MessagePort, emitter: &Emitter<E>, name: E::Name) {
    port.unref();
    let weak = port.downgrade();
    emitter.on_interest_change(name, move |interested| {
        let Some(port) = weak.upgrade() else {
            return;
        };
        if interested {
            port.ref_();
            port.start();
        } else {
            port.stop();
            port.unref();
        }
    });
}
