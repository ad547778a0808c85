pub mod dump;
pub mod noise;
pub mod sink;

use crate::alloc::{BlockContents, LeakwatchAllocator};
use crate::callstack::CallStack;
use crate::config::{Config, ReportEncoding};
use crate::hook::RequestId;
use crate::ledger::BlockLedger;
use crate::symbols::SymbolResolver;

use self::sink::ReportSink;

const ADDRESS_WIDTH: usize = 2 * std::mem::size_of::<usize>();

/// A block that is still alive and was tracked when it was allocated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Leak {
    pub request: RequestId,
    pub address: usize,
    pub size: usize,
    pub stack: CallStack,
    /// Leading bytes of the block, at most `max_data_dump` of them.
    pub data: Vec<u8>,
}

/// Report options taken from [`Config`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportOptions {
    pub max_data_dump: usize,
    pub show_noise_frames: bool,
}

impl From<&Config> for ReportOptions {
    fn from(config: &Config) -> Self {
        Self {
            max_data_dump: config.max_data_dump,
            show_noise_frames: config.show_noise_frames,
        }
    }
}

impl Default for ReportOptions {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

/// Cross-references the heap's live blocks with the [`BlockLedger`].
///
/// The heap's list lock is only held while block metadata or contents are
/// copied into buffers sized beforehand. Ledger lookups and symbol
/// resolution happen without it.
pub struct LeakReporter<'a> {
    heap: &'a LeakwatchAllocator,
    ledger: &'a BlockLedger,
    resolver: &'a SymbolResolver,
    options: ReportOptions,
}

impl<'a> LeakReporter<'a> {
    pub fn new(
        heap: &'a LeakwatchAllocator,
        ledger: &'a BlockLedger,
        resolver: &'a SymbolResolver,
        options: ReportOptions,
    ) -> Self {
        Self {
            heap,
            ledger,
            resolver,
            options,
        }
    }

    /// Current leaks, oldest request first, without their data.
    pub fn leaks(&self) -> Vec<Leak> {
        let mut blocks = Vec::new();
        self.heap.live_blocks(&mut blocks);

        let mut leaks: Vec<Leak> = blocks
            .into_iter()
            .filter_map(|block| {
                let record = self.ledger.get(block.request)?;
                Some(Leak {
                    request: block.request,
                    address: block.address,
                    size: block.size,
                    stack: record.stack,
                    data: Vec::new(),
                })
            })
            .collect();
        leaks.sort_unstable_by_key(|leak| leak.request);
        leaks
    }

    /// Like [`LeakReporter::leaks`], with the leading bytes of every block.
    pub fn leaks_with_data(&self) -> Vec<Leak> {
        let mut leaks = self.leaks();
        if self.options.max_data_dump == 0 || leaks.is_empty() {
            return leaks;
        }

        let mut contents: Vec<BlockContents> = leaks
            .iter()
            .map(|leak| BlockContents::new(leak.request, self.options.max_data_dump))
            .collect();
        self.heap.copy_contents(&mut contents);
        // both are sorted by request
        for (leak, contents) in leaks.iter_mut().zip(contents) {
            leak.data = contents.bytes().to_vec();
        }
        leaks
    }

    /// Number of current leaks.
    pub fn count(&self) -> usize {
        self.leaks().len()
    }

    /// Writes the report of every current leak to `sink`, then stops
    /// tracking them, so a second report only shows newer leaks.
    ///
    /// Returns the number of leaks reported.
    pub fn report(&self, sink: &mut ReportSink) -> usize {
        let leaks = self.leaks_with_data();

        for (index, leak) in leaks.iter().enumerate() {
            if index == 0 {
                sink.report(format_args!("WARNING: Detected memory leaks!\n"));
            }
            self.report_leak(leak, sink);
        }

        match leaks.len() {
            0 => sink.report(format_args!("No memory leaks detected.\n")),
            1 => sink.report(format_args!("Detected 1 memory leak.\n")),
            count => sink.report(format_args!("Detected {count} memory leaks.\n")),
        }
        sink.flush();

        let reported: Vec<RequestId> = leaks.iter().map(|leak| leak.request).collect();
        self.ledger.erase_all(&reported);
        leaks.len()
    }

    /// Stops tracking every current leak without reporting it.
    pub fn mark_all_reported(&self) -> usize {
        let reported: Vec<RequestId> = self.leaks().iter().map(|leak| leak.request).collect();
        self.ledger.erase_all(&reported);
        reported.len()
    }

    /// Resolves every visible frame of every current leak. Returns the number
    /// of frames whose function name could not be found.
    ///
    /// Frames of code built with debug info always resolve. What is left are
    /// usually the thread entry frames of system libraries shipped without
    /// symbols, so the count is rarely zero.
    pub fn resolve_callstacks(&self) -> usize {
        let mut unresolved = 0;
        for leak in self.leaks() {
            for pc in leak.stack.iter() {
                let frame = self.resolver.resolve(*pc);
                let visible: Vec<_> = frame
                    .iter()
                    .filter(|symbol| self.options.show_noise_frames || !noise::is_noise(symbol))
                    .collect();
                if !visible.is_empty() && visible.iter().all(|symbol| symbol.function.is_none()) {
                    unresolved += 1;
                }
            }
        }
        unresolved
    }

    fn report_leak(&self, leak: &Leak, sink: &mut ReportSink) {
        sink.report(format_args!(
            "---------- Block {} at 0x{:0width$X}: {} bytes ----------\n",
            leak.request,
            leak.address,
            leak.size,
            width = ADDRESS_WIDTH
        ));
        sink.report(format_args!("  Call Stack:\n"));

        for pc in leak.stack.iter() {
            let frame = self.resolver.resolve(*pc);
            for symbol in frame.iter() {
                if !self.options.show_noise_frames && noise::is_noise(symbol) {
                    continue;
                }
                let function = symbol
                    .function
                    .as_deref()
                    .unwrap_or("(Function name unavailable)");
                match (&symbol.file, symbol.line) {
                    (Some(file), line) => sink.report(format_args!(
                        "    {file} ({}): {function}\n",
                        line.unwrap_or(0)
                    )),
                    (None, _) => sink.report(format_args!(
                        "    0x{pc:0width$X} (File and line number not available): {function}\n",
                        width = ADDRESS_WIDTH
                    )),
                }
            }
        }

        if self.options.max_data_dump == 0 {
            return;
        }
        sink.report(format_args!("  Data:\n"));
        let rows = match sink.encoding() {
            ReportEncoding::Ascii => dump::ascii_rows(&leak.data),
            ReportEncoding::Unicode => dump::unicode_rows(&leak.data),
        };
        for row in rows {
            sink.report(format_args!("{row}\n"));
        }
        sink.report(format_args!("\n"));
    }
}
