use kafka_console::runner::Console;

fn main() {
    // Disable anyhow from taking backtraces, which makes for very verbose logs and is possibly a performance issue.
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        // Safety: Safe because this is the first thing in main, we know that we havent launched any other threads which may access set_var.
        unsafe { std::env::set_var("RUST_LIB_BACKTRACE", "0") };
    }

    Console::new().run_block();
}
