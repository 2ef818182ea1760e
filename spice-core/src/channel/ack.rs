//! Ack-windowed flow control.

/// Send-side window: at most `window` application messages may be
/// unacknowledged. `unacked <= window` holds after every operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckWindow {
    window: u32,
    unacked: u32,
}

impl AckWindow {
    /// A window of 0 would stall the channel for good, so it is raised to 1.
    pub fn new(window: u32) -> Self {
        Self {
            window: window.max(1),
            unacked: 0,
        }
    }

    pub fn can_send(&self) -> bool {
        self.unacked < self.window
    }

    /// Account for one transmitted message. Returns `false` and changes
    /// nothing if the window is full.
    pub fn on_send(&mut self) -> bool {
        if !self.can_send() {
            return false;
        }
        self.unacked += 1;
        true
    }

    /// The peer acknowledged everything sent so far.
    pub fn on_ack(&mut self) {
        self.unacked = 0;
    }

    /// Adopt a new window from SET_ACK; the count restarts.
    pub fn set_window(&mut self, window: u32) {
        self.window = window.max(1);
        self.unacked = 0;
    }

    pub fn window(&self) -> u32 {
        self.window
    }

    pub fn unacked(&self) -> u32 {
        self.unacked
    }
}

/// Receive-side acknowledgements: once armed by SET_ACK, an ACK is due
/// after every `window` inbound messages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReceiveAck {
    window: Option<u32>,
    count: u32,
}

impl ReceiveAck {
    pub fn arm(&mut self, window: u32) {
        self.window = (window > 0).then_some(window);
        self.count = 0;
    }

    /// Count one inbound message; `true` when an ACK should be sent.
    pub fn on_message(&mut self) -> bool {
        let Some(window) = self.window else {
            return false;
        };
        self.count += 1;
        if self.count >= window {
            self.count = 0;
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_blocks_at_limit() {
        let mut w = AckWindow::new(3);
        assert!(w.on_send());
        assert!(w.on_send());
        assert!(w.on_send());
        assert!(!w.can_send());
        assert!(!w.on_send());
        assert_eq!(w.unacked(), 3);

        w.on_ack();
        assert!(w.can_send());
        assert_eq!(w.unacked(), 0);
    }

    #[test]
    fn invariant_holds_over_mixed_sequence() {
        let mut w = AckWindow::new(4);
        // 1 = send, 0 = ack, 2 = shrink window
        let steps = [1, 1, 1, 1, 1, 1, 0, 1, 2, 1, 1, 1, 0, 1, 1];
        for step in steps {
            match step {
                1 => {
                    w.on_send();
                }
                0 => w.on_ack(),
                _ => w.set_window(2),
            }
            assert!(w.unacked() <= w.window());
        }
    }

    #[test]
    fn zero_window_is_raised() {
        let mut w = AckWindow::new(0);
        assert_eq!(w.window(), 1);
        w.set_window(0);
        assert!(w.can_send());
    }

    #[test]
    fn receive_ack_every_window_messages() {
        let mut r = ReceiveAck::default();
        assert!(!r.on_message());

        r.arm(3);
        let due: Vec<bool> = (0..7).map(|_| r.on_message()).collect();
        assert_eq!(due, vec![false, false, true, false, false, true, false]);

        r.arm(0);
        assert!(!r.on_message());
    }
}
