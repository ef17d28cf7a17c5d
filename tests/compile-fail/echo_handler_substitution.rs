// A composed operation cannot start a suboperation with the handler it wraps.

use safer_compose::compose::FinalHandler;
use safer_compose::testing::ScriptedStream;
use safer_compose::{AsyncStream, CompletionHandler, ErrorCode, HandlerHooks, Reactor, StreamBuf};

struct Done;

impl HandlerHooks for Done {}

impl CompletionHandler for Done {
    fn complete(self, _ec: ErrorCode, _bytes_transferred: usize) {}
}

fn main() {
    let reactor = Reactor::new().unwrap();
    let stream = ScriptedStream::new(&reactor);
    let buffer = StreamBuf::new();

    let handler = FinalHandler::new(Done);
    stream.async_read_until(&buffer, b'\n', handler);
}
