//! boltkv command-line tool
//!
//! Inspect and edit a boltkv database file.

use std::path::PathBuf;
use std::time::Duration;

use boltkv::{Bucket, Db, Options, Tx};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

/// boltkv CLI
#[derive(Parser, Debug)]
#[command(name = "boltkv")]
#[command(about = "Embedded transactional key-value store")]
#[command(version)]
struct Args {
    /// Database file
    #[arg(short, long, default_value = "my.db")]
    db: PathBuf,

    /// Seconds to wait for the file lock
    #[arg(short, long, default_value = "1")]
    timeout: u64,

    /// Page size for newly created files
    #[arg(long, default_value = "4096")]
    page_size: usize,

    /// Skip fsync on commit
    #[arg(long)]
    no_sync: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the walkthrough: create a bucket, put/get, integer keys, cursor, for_each
    Demo,

    /// Create a bucket (and any missing parents)
    CreateBucket {
        /// Bucket path, outermost first (repeat for nesting)
        #[arg(short, long = "bucket", required = true)]
        buckets: Vec<String>,
    },

    /// Set a key-value pair
    Put {
        #[arg(short, long = "bucket", required = true)]
        buckets: Vec<String>,
        key: String,
        value: String,
    },

    /// Get a value by key
    Get {
        #[arg(short, long = "bucket", required = true)]
        buckets: Vec<String>,
        key: String,
    },

    /// Delete a key
    Delete {
        #[arg(short, long = "bucket", required = true)]
        buckets: Vec<String>,
        key: String,
    },

    /// List the key-value pairs of a bucket
    Keys {
        #[arg(short, long = "bucket", required = true)]
        buckets: Vec<String>,
    },

    /// List nested buckets (top-level buckets without --bucket)
    Buckets {
        #[arg(short, long = "bucket")]
        buckets: Vec<String>,
    },

    /// Print database statistics (and a bucket's, with --bucket)
    Stats {
        #[arg(short, long = "bucket")]
        buckets: Vec<String>,
    },

    /// Verify the file's page structure
    Check,

    /// Write a consistent copy of the database
    Backup {
        /// Destination file
        dest: PathBuf,
    },
}

fn main() {
    // Initialize tracing/logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,boltkv=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let args = Args::parse();

    let options = Options::builder()
        .timeout(Duration::from_secs(args.timeout))
        .page_size(args.page_size)
        .no_sync(args.no_sync)
        .build();

    let db = match Db::open(&args.db, options) {
        Ok(db) => db,
        Err(e) => {
            tracing::error!("Failed to open {}: {}", args.db.display(), e);
            std::process::exit(1);
        }
    };

    let result = run(&db, args.command);
    let closed = db.close();

    if let Err(e) = result.and(closed) {
        tracing::error!("{}", e);
        std::process::exit(1);
    }
}

fn run(db: &Db, command: Commands) -> boltkv::Result<()> {
    match command {
        Commands::Demo => demo(db),

        Commands::CreateBucket { buckets } => db.update(|tx| -> boltkv::Result<()> {
            let mut bucket = tx.create_bucket_if_not_exists(buckets[0].as_bytes())?;
            for name in &buckets[1..] {
                bucket = bucket.create_bucket_if_not_exists(name.as_bytes())?;
            }
            println!("created {}", buckets.join("/"));
            Ok(())
        }),

        Commands::Put { buckets, key, value } => db.update(|tx| -> boltkv::Result<()> {
            open_path(tx, &buckets)?.put(key.as_bytes(), value.as_bytes())
        }),

        Commands::Get { buckets, key } => db.view(|tx| -> boltkv::Result<()> {
            match open_path(tx, &buckets)?.get(key.as_bytes())? {
                Some(value) => println!("{}", display(&value)),
                None => println!("(not found)"),
            }
            Ok(())
        }),

        Commands::Delete { buckets, key } => db.update(|tx| -> boltkv::Result<()> {
            open_path(tx, &buckets)?.delete(key.as_bytes())
        }),

        Commands::Keys { buckets } => db.view(|tx| -> boltkv::Result<()> {
            open_path(tx, &buckets)?.for_each(|k, v| {
                println!("{} = {}", display(k), display(v));
                Ok(())
            })
        }),

        Commands::Buckets { buckets } => db.view(|tx| -> boltkv::Result<()> {
            if buckets.is_empty() {
                return tx.for_each(|name, _| {
                    println!("{}", display(name));
                    Ok(())
                });
            }
            open_path(tx, &buckets)?.for_each_bucket(|name| {
                println!("{}", display(name));
                Ok(())
            })
        }),

        Commands::Stats { buckets } => {
            println!("{:#?}", db.stats());
            if buckets.is_empty() {
                return Ok(());
            }
            db.view(|tx| -> boltkv::Result<()> {
                println!("{:#?}", open_path(tx, &buckets)?.stats()?);
                Ok(())
            })
        }

        Commands::Check => db.view(|tx| -> boltkv::Result<()> {
            tx.check()?;
            println!("OK");
            Ok(())
        }),

        Commands::Backup { dest } => db.view(|tx| -> boltkv::Result<()> {
            tx.copy_file(&dest)?;
            println!("wrote {} ({} bytes)", dest.display(), tx.size());
            Ok(())
        }),
    }
}

/// Open a nested bucket by path
fn open_path<'tx>(tx: &'tx Tx, path: &[String]) -> boltkv::Result<Bucket<'tx>> {
    let Some((first, rest)) = path.split_first() else {
        return Err(boltkv::BoltError::BucketNameRequired);
    };
    let mut bucket = tx.bucket(first.as_bytes())?;
    for name in rest {
        bucket = bucket.bucket(name.as_bytes())?;
    }
    Ok(bucket)
}

/// Render bytes as text when printable, hex otherwise
fn display(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) if s.chars().all(|c| !c.is_control()) => s.to_string(),
        _ => bytes.iter().map(|b| format!("{:02x}", b)).collect(),
    }
}

// =============================================================================
// Demo
// =============================================================================

const DEMO_BUCKET: &[u8] = b"tstBucket";
const DEMO_KEY: &[u8] = b"tstKey";
const DEMO_VALUE: &[u8] = b"tstValue";

/// 8-byte big-endian encoding, so integer keys sort numerically
fn itob(v: u64) -> [u8; 8] {
    v.to_be_bytes()
}

fn demo(db: &Db) -> boltkv::Result<()> {
    db.update(|tx| -> boltkv::Result<()> {
        tx.create_bucket_if_not_exists(DEMO_BUCKET)?;
        Ok(())
    })?;

    db.update(|tx| -> boltkv::Result<()> {
        tx.bucket(DEMO_BUCKET)?.put(DEMO_KEY, DEMO_VALUE)
    })?;

    db.view(|tx| -> boltkv::Result<()> {
        let value = tx.bucket(DEMO_BUCKET)?.get(DEMO_KEY)?.unwrap_or_default();
        println!("key {} has value {}", display(DEMO_KEY), display(&value));
        Ok(())
    })?;

    db.update(|tx| -> boltkv::Result<()> {
        let bucket = tx.bucket(DEMO_BUCKET)?;
        for i in 0..10 {
            bucket.put(&itob(i), &itob(i * 1000))?;
        }
        Ok(())
    })?;

    println!("cursor ....");
    db.view(|tx| -> boltkv::Result<()> {
        let bucket = tx.bucket(DEMO_BUCKET)?;
        let mut cursor = bucket.cursor();
        let mut item = cursor.first()?;
        while let Some((k, v)) = item {
            println!("key={}, value={}", display(&k), display(&v));
            item = cursor.next()?;
        }
        Ok(())
    })?;

    println!("forEach()...");
    db.view(|tx| -> boltkv::Result<()> {
        tx.bucket(DEMO_BUCKET)?.for_each(|k, v| {
            println!("key={}, value={}", display(k), display(v));
            Ok(())
        })
    })
}
