#![no_main]

use libfuzzer_sys::fuzz_target;
use tictactoe_session_client::protocol::ServerMessage;

fuzz_target!(|data: &[u8]| {
    // Raw-byte path, including serde_json's own UTF-8 validation.
    let _ = serde_json::from_slice::<ServerMessage>(data);

    if let Ok(s) = std::str::from_utf8(data) {
        if let Ok(msg) = serde_json::from_str::<ServerMessage>(s) {
            // Every decodable frame must map to a routing kind.
            let _ = msg.kind();
        }
    }
});
