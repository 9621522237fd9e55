use backtrace::{Backtrace, BacktraceFmt, BytesOrWideString, PrintFmt};
use std::fmt;
use std::panic::PanicHookInfo;

/// Reports panics as `error!` events so json log output stays valid json.
pub fn setup() {
    std::panic::set_hook(Box::new(|panic| {
        let backtrace = ShortBacktrace(Backtrace::new());
        let thread = std::thread::current();
        let thread = thread.name().unwrap_or("<unnamed>");
        match panic.location() {
            Some(location) => tracing::error!(
                message = %payload(panic),
                panic.thread = thread,
                panic.file = location.file(),
                panic.line = location.line(),
                panic.column = location.column(),
                panic.backtrace = %backtrace,
            ),
            None => tracing::error!(
                message = %payload(panic),
                panic.thread = thread,
                panic.backtrace = %backtrace,
            ),
        }
    }));
}

fn payload<'a>(panic: &'a PanicHookInfo<'_>) -> &'a str {
    if let Some(message) = panic.payload().downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.payload().downcast_ref::<String>() {
        message
    } else {
        "Box<dyn Any>"
    }
}

/// Formats only the frames between the panic machinery and the runtime entry point,
/// with paths relative to the working directory where possible.
struct ShortBacktrace(Backtrace);

impl fmt::Display for ShortBacktrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cwd = std::env::current_dir().ok();
        let mut print_path = move |fmt: &mut fmt::Formatter<'_>, path: BytesOrWideString<'_>| {
            let path = path.into_path_buf();
            match cwd.as_ref().and_then(|cwd| path.strip_prefix(cwd).ok()) {
                Some(relative) => fmt::Display::fmt(&relative.display(), fmt),
                None => fmt::Display::fmt(&path.display(), fmt),
            }
        };

        let mut f = BacktraceFmt::new(f, PrintFmt::Short, &mut print_path);
        f.add_context()?;
        for (frame, _) in backtrace_ext::short_frames_strict(&self.0) {
            f.frame().backtrace_frame(frame)?;
        }
        f.finish()
    }
}
