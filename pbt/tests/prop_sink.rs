//! 出力状態機械のプロパティテスト

use proptest::prelude::*;
use shiguredo_http_proto::{MemoryTransport, OutputSink, SinkState};

#[derive(Debug, Clone)]
enum Op {
    Header(Vec<u8>),
    Write(Vec<u8>),
    TryWrite(Vec<u8>),
    End(Vec<u8>),
    Budget(usize),
    Writable,
    Aborted,
}

fn data() -> impl Strategy<Value = Vec<u8>> {
    proptest::collection::vec(any::<u8>(), 0..32)
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        1 => data().prop_map(Op::Header),
        4 => data().prop_map(Op::Write),
        1 => data().prop_map(Op::TryWrite),
        1 => data().prop_map(Op::End),
        4 => (0usize..48).prop_map(Op::Budget),
        3 => Just(Op::Writable),
        1 => Just(Op::Aborted),
    ]
}

fn ops() -> impl Strategy<Value = Vec<Op>> {
    proptest::collection::vec(op(), 0..40)
}

proptest! {
    #[test]
    fn accounting_invariant(initial in 0usize..32, ops in ops()) {
        let mut sink = OutputSink::new(MemoryTransport::with_budget(initial));
        // 積まれたはずのバイト列
        let mut enqueued = Vec::new();

        for op in ops {
            let before = sink.state();
            let closed = before.is_terminal() || sink.has_responded();
            match op {
                Op::Header(d) => {
                    if sink.write_header(&d).is_ok() {
                        enqueued.extend_from_slice(&d);
                    }
                }
                Op::Write(d) => {
                    sink.write(&d);
                    if !closed {
                        enqueued.extend_from_slice(&d);
                    }
                }
                Op::TryWrite(d) => {
                    let n = sink.try_write(&d);
                    enqueued.extend_from_slice(&d[..n]);
                }
                Op::End(d) => {
                    sink.end(&d);
                    if !closed {
                        enqueued.extend_from_slice(&d);
                    }
                }
                Op::Budget(n) => sink.transport_mut().add_budget(n),
                Op::Writable => {
                    sink.handle_writable();
                }
                Op::Aborted => sink.handle_aborted(),
            }

            prop_assert_eq!(
                sink.total_flushed() + sink.buffered_amount() as u64,
                sink.total_enqueued()
            );
            prop_assert_eq!(sink.total_enqueued(), enqueued.len() as u64);
            let written = sink.transport().written();
            prop_assert_eq!(written.len() as u64, sink.total_flushed());
            prop_assert_eq!(written, &enqueued[..written.len()]);

            // 終端状態からは抜けない
            if before.is_terminal() {
                prop_assert_eq!(sink.state(), before);
            }
            if sink.state() == SinkState::Ended {
                prop_assert_eq!(sink.buffered_amount(), 0);
                prop_assert!(sink.transport().is_shutdown());
            }
        }
    }

    #[test]
    fn abort_is_terminal_and_silent(ops in ops()) {
        let mut sink = OutputSink::new(MemoryTransport::with_budget(0));
        sink.write(b"pending");
        sink.handle_aborted();
        prop_assert_eq!(sink.state(), SinkState::Aborted);

        for op in ops {
            match op {
                Op::Header(d) => prop_assert!(sink.write_header(&d).is_err()),
                Op::Write(d) => prop_assert!(!sink.write(&d)),
                Op::TryWrite(d) => prop_assert_eq!(sink.try_write(&d), 0),
                Op::End(d) => prop_assert!(!sink.end(&d)),
                Op::Budget(n) => sink.transport_mut().add_budget(n),
                Op::Writable => {
                    sink.handle_writable();
                }
                Op::Aborted => sink.handle_aborted(),
            }
            prop_assert_eq!(sink.state(), SinkState::Aborted);
            prop_assert!(sink.transport().written().is_empty());
            prop_assert!(!sink.transport().is_shutdown());
        }
    }

    #[test]
    fn unlimited_transport_never_buffers(writes in proptest::collection::vec(data(), 0..16)) {
        let mut sink = OutputSink::new(MemoryTransport::new());
        let mut expected = Vec::new();
        for d in &writes {
            prop_assert!(sink.write(d));
            expected.extend_from_slice(d);
        }
        prop_assert!(sink.end(b""));
        prop_assert_eq!(sink.state(), SinkState::Ended);
        prop_assert_eq!(sink.transport().written(), expected.as_slice());
    }
}
