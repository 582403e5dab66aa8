// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Optional packet-capture tracing (component K). The core never writes to
//! stdout/stderr or a file directly; it hands tagged records to a
//! user-installed sink only when `CAPTURE_PACKETS` is set on a PD.

/// Direction a captured frame travelled.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Direction {
    Tx,
    Rx,
}

/// A single captured frame, timestamped against the context's clock.
pub struct Capture<'a> {
    pub pd_address: u8,
    pub direction: Direction,
    pub millis: i64,
    pub bytes: &'a [u8],
}

/// Sink for captured frames. Implementors typically write a pcap-ng record
/// or append to an in-memory trace buffer for later inspection; the core
/// places no constraint on the backing storage.
pub trait PcapWriter {
    fn write(&mut self, capture: &Capture);
}

/// A `PcapWriter` that discards everything; the default when no writer is
/// registered.
#[derive(Default)]
pub struct NullWriter;

impl PcapWriter for NullWriter {
    fn write(&mut self, _capture: &Capture) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingWriter {
        count: usize,
    }

    impl PcapWriter for CountingWriter {
        fn write(&mut self, _capture: &Capture) {
            self.count += 1;
        }
    }

    #[test]
    fn writer_receives_captures() {
        let mut w = CountingWriter { count: 0 };
        let bytes = [0xFFu8, 0x53, 0x01];
        w.write(&Capture {
            pd_address: 1,
            direction: Direction::Tx,
            millis: 1000,
            bytes: &bytes,
        });
        assert_eq!(w.count, 1);
    }

    #[test]
    fn null_writer_discards() {
        let mut w = NullWriter;
        w.write(&Capture {
            pd_address: 1,
            direction: Direction::Rx,
            millis: 0,
            bytes: &[],
        });
    }
}
