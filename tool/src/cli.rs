use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[clap(flatten)]
    pub index: IndexParams,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create an empty index, or check that an existing one opens.
    Init,
    /// Print the value stored for a key.
    Get(KeyParams),
    /// Store a value for a key.
    Set(SetParams),
    /// Remove the value stored for a key and print it.
    Remove(KeyParams),
    /// Print every entry as `<hash in hex> <value>`, in hash order.
    Dump {
        /// Stop after this many entries.
        #[arg(long)]
        limit: Option<u64>,
    },
    /// Print the shape of the trie and the size of the index file.
    Stats,
    /// Insert and read back random keys from many threads and report the timings.
    ///
    /// The index is cleared first.
    Bench(BenchParams),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum HasherKind {
    /// BLAKE3, any hash length up to 64.
    Blake3,
    /// SHA2-256, hash lengths up to 32.
    Sha2,
    /// xxHash64, hash lengths up to 8. Fast, but not collision resistant.
    Xx,
}

#[derive(Clone, Debug, Args)]
pub struct IndexParams {
    /// The directory holding the index.
    #[clap(default_value = "hashtrie_db")]
    #[arg(long, short, global = true)]
    pub path: PathBuf,

    /// The key hasher. Must be the same every time the index is opened.
    #[clap(default_value = "blake3")]
    #[arg(long, global = true)]
    pub hasher: HasherKind,

    /// The number of hash bytes, i.e. the depth of the trie. Must be the same every time the
    /// index is opened.
    #[clap(default_value = "4")]
    #[clap(value_parser=clap::value_parser!(u8).range(1..=64))]
    #[arg(long, global = true)]
    pub hash_length: u8,

    /// The size of the node cache in MiB.
    #[clap(default_value = "64")]
    #[arg(long, global = true)]
    pub cache_size: usize,

    /// Do not sync the index file after every write.
    #[arg(long, global = true)]
    pub no_sync: bool,

    /// Interpret keys as hex strings instead of UTF-8 text.
    #[arg(long, global = true)]
    pub hex_keys: bool,
}

#[derive(Clone, Debug, Args)]
pub struct KeyParams {
    pub key: String,
}

#[derive(Clone, Debug, Args)]
pub struct SetParams {
    pub key: String,

    /// Any 64-bit signed integer except -1.
    #[arg(allow_negative_numbers = true)]
    pub value: i64,
}

#[derive(Clone, Debug, Args)]
pub struct BenchParams {
    /// The number of keys to insert.
    #[clap(default_value = "100000")]
    #[arg(long, short)]
    pub keys: u64,

    /// The number of worker threads.
    #[clap(default_value = "8")]
    #[arg(long, short)]
    pub threads: usize,

    /// Seed of the key generator.
    #[clap(default_value = "0")]
    #[arg(long)]
    pub seed: u64,
}
