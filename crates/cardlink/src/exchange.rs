//! Frame exchange and response reassembly
//!
//! Runs one logical command against a transport: sends the chained frames
//! in order, then follows `61 XX` continuation statuses until a terminal
//! status word arrives. Called only from the connection worker thread, so
//! a whole exchange is atomic with respect to other commands.

use std::time::Instant;

use cardlink_apdu::{
    build_frames, Apdu, EncodeError, Response, MAX_FRAGMENT_LEN, SW_CONDITIONS_NOT_SATISFIED,
    SW_SUCCESS,
};
use tracing::{debug, trace};

use crate::error::{CardError, CardResult};
use crate::queue::CommandConfiguration;
use crate::transport::Transport;

/// Upper bound on continuation reads for a single command. A healthy
/// device reporting `61 XX` converges long before this; hitting the cap
/// means the device is looping and the connection can no longer be
/// trusted.
pub(crate) const MAX_CONTINUATION_READS: usize = 128;

/// Execute one command, including busy retries when the configuration
/// opts in. Returns the reassembled payload on terminal `9000`.
pub(crate) fn execute_exchange(
    transport: &mut dyn Transport,
    apdu: &Apdu,
    config: &CommandConfiguration,
    deadline: Instant,
) -> CardResult<Vec<u8>> {
    let frames = build_frames(apdu, MAX_FRAGMENT_LEN)?;

    loop {
        match run_frames(transport, &frames, config, deadline) {
            Err(CardError::Device { sw })
                if sw == SW_CONDITIONS_NOT_SATISFIED && config.retry_on_busy =>
            {
                if Instant::now() + config.retry_interval >= deadline {
                    return Err(CardError::Timeout);
                }
                debug!("device busy ({sw:04X}), retrying in {:?}", config.retry_interval);
                std::thread::sleep(config.retry_interval);
            }
            other => return other,
        }
    }
}

fn run_frames(
    transport: &mut dyn Transport,
    frames: &[cardlink_apdu::Frame],
    config: &CommandConfiguration,
    deadline: Instant,
) -> CardResult<Vec<u8>> {
    let Some((last, chained)) = frames.split_last() else {
        return Err(CardError::Protocol("no frames to send"));
    };

    // Every chain part but the last must come back clean before the next
    // may be sent.
    for part in chained {
        check_deadline(deadline)?;
        let resp = round_trip(transport, part.as_bytes())?;
        if !resp.is_success() {
            return Err(CardError::Device {
                sw: resp.status_word(),
            });
        }
    }

    check_deadline(deadline)?;
    let mut resp = round_trip(transport, last.as_bytes())?;
    let mut payload = std::mem::take(&mut resp.data);

    let mut reads = 0;
    while let Some(remaining) = resp.more_data() {
        reads += 1;
        if reads > MAX_CONTINUATION_READS {
            return Err(CardError::Protocol("continuation reads exceeded bound"));
        }
        check_deadline(deadline)?;
        trace!(remaining, reads, "requesting remaining response data");
        let cont = config.send_remaining.continuation_frame(remaining);
        resp = round_trip(transport, &cont)?;
        payload.extend_from_slice(&resp.data);
    }

    if resp.status_word() == SW_SUCCESS {
        // A response that arrives after the deadline still fails the unit;
        // the caller has long been promised a timely answer or an error.
        check_deadline(deadline)?;
        Ok(payload)
    } else {
        // Partial data is not meaningful on error; the accumulator is
        // discarded.
        Err(CardError::Device {
            sw: resp.status_word(),
        })
    }
}

fn round_trip(transport: &mut dyn Transport, frame: &[u8]) -> CardResult<Response> {
    let raw = transport.transmit(frame)?;
    match Response::parse(&raw) {
        Ok(resp) => Ok(resp),
        Err(EncodeError::ResponseTooShort(_)) => {
            Err(CardError::Protocol("response shorter than a status word"))
        }
        Err(e) => Err(CardError::Encode(e)),
    }
}

fn check_deadline(deadline: Instant) -> CardResult<()> {
    if Instant::now() >= deadline {
        Err(CardError::Timeout)
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportError;
    use cardlink_apdu::SendRemaining;
    use std::collections::VecDeque;
    use std::time::Duration;

    /// Scripted transport: pops one canned response per transmit and
    /// records every frame it saw.
    struct Scripted {
        responses: VecDeque<Vec<u8>>,
        sent: Vec<Vec<u8>>,
    }

    impl Scripted {
        fn new(responses: Vec<Vec<u8>>) -> Self {
            Self {
                responses: responses.into(),
                sent: Vec::new(),
            }
        }
    }

    impl Transport for Scripted {
        fn transmit(&mut self, frame: &[u8]) -> Result<Vec<u8>, TransportError> {
            self.sent.push(frame.to_vec());
            self.responses
                .pop_front()
                .ok_or_else(|| TransportError::Lost("script exhausted".into()))
        }
    }

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    #[test]
    fn single_frame_success() {
        let mut t = Scripted::new(vec![vec![0xDE, 0xAD, 0x90, 0x00]]);
        let apdu = Apdu::new(0x00, 0xB0, 0x00, 0x00);
        let out = execute_exchange(&mut t, &apdu, &CommandConfiguration::default(), deadline());
        assert_eq!(out.unwrap(), vec![0xDE, 0xAD]);
        assert_eq!(t.sent.len(), 1);
    }

    #[test]
    fn more_data_status_triggers_one_continuation_read() {
        // 61 05, then five bytes with 90 00: one GET RESPONSE frame only.
        let mut t = Scripted::new(vec![
            vec![0x61, 0x05],
            vec![0x01, 0x02, 0x03, 0x04, 0x05, 0x90, 0x00],
        ]);
        let apdu = Apdu::new(0x00, 0xA4, 0x04, 0x00);
        let out =
            execute_exchange(&mut t, &apdu, &CommandConfiguration::default(), deadline()).unwrap();
        assert_eq!(out, vec![0x01, 0x02, 0x03, 0x04, 0x05]);
        assert_eq!(t.sent.len(), 2);
        assert_eq!(t.sent[1], vec![0x00, 0xC0, 0x00, 0x00, 0x05]);
    }

    #[test]
    fn oath_variant_uses_its_own_instruction() {
        let mut t = Scripted::new(vec![vec![0x61, 0x02], vec![0xAA, 0xBB, 0x90, 0x00]]);
        let apdu = Apdu::new(0x00, 0xA1, 0x00, 0x00);
        let config = CommandConfiguration {
            send_remaining: SendRemaining::Oath,
            ..Default::default()
        };
        execute_exchange(&mut t, &apdu, &config, deadline()).unwrap();
        assert_eq!(t.sent[1], vec![0x00, 0xA5, 0x00, 0x00, 0x02]);
    }

    #[test]
    fn continuation_payload_accumulates_across_reads() {
        let mut t = Scripted::new(vec![
            vec![0x01, 0x02, 0x61, 0x02],
            vec![0x03, 0x04, 0x61, 0x01],
            vec![0x05, 0x90, 0x00],
        ]);
        let apdu = Apdu::new(0x00, 0xB0, 0x00, 0x00);
        let out =
            execute_exchange(&mut t, &apdu, &CommandConfiguration::default(), deadline()).unwrap();
        assert_eq!(out, vec![0x01, 0x02, 0x03, 0x04, 0x05]);
    }

    #[test]
    fn endless_continuation_fails_with_protocol_error() {
        // Device that always claims one more byte.
        struct Looping;
        impl Transport for Looping {
            fn transmit(&mut self, _frame: &[u8]) -> Result<Vec<u8>, TransportError> {
                Ok(vec![0x61, 0x01])
            }
        }
        let apdu = Apdu::new(0x00, 0xB0, 0x00, 0x00);
        let out = execute_exchange(
            &mut Looping,
            &apdu,
            &CommandConfiguration::default(),
            deadline(),
        );
        assert_eq!(out, Err(CardError::Protocol("continuation reads exceeded bound")));
    }

    #[test]
    fn device_error_discards_partial_data() {
        let mut t = Scripted::new(vec![vec![0x01, 0x02, 0x61, 0x02], vec![0x03, 0x6A, 0x82]]);
        let apdu = Apdu::new(0x00, 0xB0, 0x00, 0x00);
        let out = execute_exchange(&mut t, &apdu, &CommandConfiguration::default(), deadline());
        assert_eq!(out, Err(CardError::Device { sw: 0x6A82 }));
    }

    #[test]
    fn chained_parts_are_sent_in_order() {
        let payload = vec![0x55; 600];
        let apdu = Apdu::new(0x00, 0xD6, 0x00, 0x00).data(payload);
        // Two intermediate acks, then the final response.
        let mut t = Scripted::new(vec![
            vec![0x90, 0x00],
            vec![0x90, 0x00],
            vec![0x90, 0x00],
        ]);
        execute_exchange(&mut t, &apdu, &CommandConfiguration::default(), deadline()).unwrap();
        assert_eq!(t.sent.len(), 3);
        assert_eq!(t.sent[0][0], 0x10);
        assert_eq!(t.sent[1][0], 0x10);
        assert_eq!(t.sent[2][0], 0x00);
    }

    #[test]
    fn chain_part_rejection_aborts_the_command() {
        let payload = vec![0x55; 300];
        let apdu = Apdu::new(0x00, 0xD6, 0x00, 0x00).data(payload);
        let mut t = Scripted::new(vec![vec![0x6A, 0x86]]);
        let out = execute_exchange(&mut t, &apdu, &CommandConfiguration::default(), deadline());
        assert_eq!(out, Err(CardError::Device { sw: 0x6A86 }));
        assert_eq!(t.sent.len(), 1);
    }

    #[test]
    fn busy_retry_reruns_the_exchange() {
        let mut t = Scripted::new(vec![
            vec![0x69, 0x85],
            vec![0x69, 0x85],
            vec![0x0A, 0x90, 0x00],
        ]);
        let apdu = Apdu::new(0x00, 0x01, 0x00, 0x00);
        let config = CommandConfiguration {
            retry_on_busy: true,
            retry_interval: Duration::from_millis(1),
            ..Default::default()
        };
        let out = execute_exchange(&mut t, &apdu, &config, deadline()).unwrap();
        assert_eq!(out, vec![0x0A]);
        assert_eq!(t.sent.len(), 3);
    }

    #[test]
    fn busy_without_retry_is_a_device_error() {
        let mut t = Scripted::new(vec![vec![0x69, 0x85]]);
        let apdu = Apdu::new(0x00, 0x01, 0x00, 0x00);
        let out = execute_exchange(&mut t, &apdu, &CommandConfiguration::default(), deadline());
        assert_eq!(out, Err(CardError::Device { sw: 0x6985 }));
    }

    #[test]
    fn busy_retry_respects_the_deadline() {
        struct AlwaysBusy;
        impl Transport for AlwaysBusy {
            fn transmit(&mut self, _frame: &[u8]) -> Result<Vec<u8>, TransportError> {
                Ok(vec![0x69, 0x85])
            }
        }
        let apdu = Apdu::new(0x00, 0x01, 0x00, 0x00);
        let config = CommandConfiguration {
            retry_on_busy: true,
            retry_interval: Duration::from_millis(5),
            timeout: Duration::from_millis(20),
            ..Default::default()
        };
        let out = execute_exchange(
            &mut AlwaysBusy,
            &apdu,
            &config,
            Instant::now() + config.timeout,
        );
        assert_eq!(out, Err(CardError::Timeout));
    }

    #[test]
    fn truncated_response_is_a_protocol_error() {
        let mut t = Scripted::new(vec![vec![0x90]]);
        let apdu = Apdu::new(0x00, 0xB0, 0x00, 0x00);
        let out = execute_exchange(&mut t, &apdu, &CommandConfiguration::default(), deadline());
        assert_eq!(
            out,
            Err(CardError::Protocol("response shorter than a status word"))
        );
    }

    #[test]
    fn transport_failure_propagates() {
        let mut t = Scripted::new(vec![]);
        let apdu = Apdu::new(0x00, 0xB0, 0x00, 0x00);
        let out = execute_exchange(&mut t, &apdu, &CommandConfiguration::default(), deadline());
        assert!(matches!(out, Err(CardError::Transport(_))));
    }
}
