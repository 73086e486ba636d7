//! Generate test vectors for controller interop testing.
//!
//! Run with: cargo run --package protocol --example test_vectors

use protocol::messages::*;
use protocol::{ChannelKind, Frame, FrameCodec};

fn main() {
    let codec = FrameCodec::new();

    // Frame vector 1: keystrokes for a session
    let stdin = Frame::new(ChannelKind::Stdin, "sess-1", b"ls\n".to_vec());
    print_test_vector("frame_stdin", &codec.encode(&stdin).expect("encoding failed"));

    // Frame vector 2: shell output
    let stdout = Frame::new(ChannelKind::Stdout, "sess-1", b"Hello".to_vec());
    print_test_vector("frame_stdout", &codec.encode(&stdout).expect("encoding failed"));

    // Frame vector 3: shell error output
    let stderr = Frame::new(ChannelKind::Stderr, "sess-1", b"denied".to_vec());
    print_test_vector("frame_stderr", &codec.encode(&stderr).expect("encoding failed"));

    // Control vector 1: connect
    let connect = ControlMessage::Connect(ConnectRequest {
        session_id: "sess-1".to_string(),
        hostname: "node-a".to_string(),
        username: "root".to_string(),
        port: 22,
    });
    print_control_vector("control_connect", &connect.encode().expect("encoding failed"));

    // Control vector 2: resize
    let resize = ControlMessage::Resize(ResizeRequest {
        session_id: "sess-1".to_string(),
        rows: 40,
        cols: 120,
    });
    print_control_vector("control_resize", &resize.encode().expect("encoding failed"));

    // Control vector 3: terminate
    let terminate = ControlMessage::Terminate(TerminateRequest {
        session_id: "sess-1".to_string(),
    });
    print_control_vector("control_terminate", &terminate.encode().expect("encoding failed"));

    // Event vector: connect failure
    let failed = ControlEvent::ConnectFailed {
        session_id: "sess-1".to_string(),
        error: "dial_failed".to_string(),
    };
    print_control_vector("event_connect_failed", &failed.encode().expect("encoding failed"));
}

fn print_control_vector(name: &str, body: &[u8]) {
    let framed = length_prefixed(body).expect("message too large");
    print_test_vector(name, &framed);
}

fn print_test_vector(name: &str, bytes: &[u8]) {
    print!("export const {} = new Uint8Array([", name);
    for (i, b) in bytes.iter().enumerate() {
        if i > 0 {
            print!(", ");
        }
        print!("{}", b);
    }
    println!("]);");
}
