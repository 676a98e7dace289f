#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use shiguredo_http_proto::{MemoryTransport, OutputSink, SinkState};

#[derive(Arbitrary, Debug)]
enum Op {
    Header(Vec<u8>),
    Write(Vec<u8>),
    TryWrite(Vec<u8>),
    End(Vec<u8>),
    Budget(u8),
    Writable,
    Data(Vec<u8>, bool),
    Aborted,
}

#[derive(Arbitrary, Debug)]
struct FuzzInput {
    initial_budget: u8,
    ops: Vec<Op>,
}

fuzz_target!(|input: FuzzInput| {
    let mut sink = OutputSink::new(MemoryTransport::with_budget(usize::from(
        input.initial_budget,
    )));
    sink.on_data(|_, _| {});
    sink.on_writable(|sink, _| sink.write(b"w"));

    for op in input.ops {
        let before = sink.state();
        match op {
            Op::Header(d) => {
                let _ = sink.write_header(&d);
            }
            Op::Write(d) => {
                sink.write(&d);
            }
            Op::TryWrite(d) => {
                assert!(sink.try_write(&d) <= d.len());
            }
            Op::End(d) => {
                sink.end(&d);
            }
            Op::Budget(n) => sink.transport_mut().add_budget(usize::from(n)),
            Op::Writable => {
                sink.handle_writable();
            }
            Op::Data(d, is_last) => sink.handle_data(&d, is_last),
            Op::Aborted => sink.handle_aborted(),
        }

        assert_eq!(
            sink.total_flushed() + sink.buffered_amount() as u64,
            sink.total_enqueued()
        );
        assert_eq!(
            sink.transport().written().len() as u64,
            sink.total_flushed()
        );
        if before.is_terminal() {
            assert_eq!(sink.state(), before);
        }
        if sink.state() == SinkState::Ended {
            assert_eq!(sink.buffered_amount(), 0);
        }
    }
});
