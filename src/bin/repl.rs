//! Interactive line-based shell over a [`tessera::Database`].
//!
//! Commands: `get <key>`, `set <key> <value>`, `del <key>`, `scan`, `.exit`.
//! Each command runs inside its own transaction, committed immediately on
//! success.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tessera::page::VALUE_SIZE;
use tessera::{Database, Options};

enum Command {
    Exit,
    Get(u64),
    Set(u64, String),
    Del(u64),
    Scan,
    Empty,
}

fn parse(line: &str) -> Result<Command, String> {
    let line = line.trim_end();
    if line == ".exit" {
        return Ok(Command::Exit);
    }
    if line.is_empty() {
        return Ok(Command::Empty);
    }

    let mut parts = line.splitn(3, ' ');
    match parts.next() {
        Some("get") => {
            let key: u64 = parts
                .next()
                .ok_or("usage: get <key>")?
                .parse()
                .map_err(|_| "key must be an integer")?;
            Ok(Command::Get(key))
        }
        Some("set") => {
            let key: u64 = parts
                .next()
                .ok_or("usage: set <key> <value>")?
                .parse()
                .map_err(|_| "key must be an integer")?;
            let value = parts.next().ok_or("usage: set <key> <value>")?.to_string();
            Ok(Command::Set(key, value))
        }
        Some("del") => {
            let key: u64 = parts
                .next()
                .ok_or("usage: del <key>")?
                .parse()
                .map_err(|_| "key must be an integer")?;
            Ok(Command::Del(key))
        }
        Some("scan") => Ok(Command::Scan),
        Some(other) => Err(format!("unrecognized command '{other}'")),
        None => Ok(Command::Empty),
    }
}

fn encode_value(s: &str) -> [u8; VALUE_SIZE] {
    let mut buf = [0u8; VALUE_SIZE];
    let bytes = s.as_bytes();
    let n = bytes.len().min(VALUE_SIZE);
    buf[..n].copy_from_slice(&bytes[..n]);
    buf
}

fn decode_value(v: &[u8; VALUE_SIZE]) -> String {
    let end = v.iter().position(|b| *b == 0).unwrap_or(v.len());
    String::from_utf8_lossy(&v[..end]).into_owned()
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let path: PathBuf = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("tessera.db"));

    let db = Database::open(&path, Options::default())?;

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = Arc::clone(&shutdown);
        ctrlc::set_handler(move || {
            shutdown.store(true, Ordering::SeqCst);
        })?;
    }

    let mut stdio = io::stdin().lock();
    let mut stdout = io::stdout().lock();

    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        write!(&mut stdout, "> ")?;
        stdout.flush()?;

        let mut line = String::new();
        if stdio.read_line(&mut line)? == 0 {
            break;
        }

        match parse(&line) {
            Ok(Command::Exit) => break,
            Ok(Command::Empty) => {}
            Ok(Command::Get(key)) => {
                let result = db.view(|tx| tx.get(key));
                match result {
                    Ok(Some(value)) => println!("{}", decode_value(&value)),
                    Ok(None) => println!("(not found)"),
                    Err(e) => eprintln!("error: {e}"),
                }
            }
            Ok(Command::Set(key, value)) => {
                let result = (|| -> Result<(), tessera::Error> {
                    let mut tx = db.begin(true)?;
                    tx.insert(key, encode_value(&value))?;
                    tx.commit()
                })();
                match result {
                    Ok(()) => println!("ok"),
                    Err(e) => eprintln!("error: {e}"),
                }
            }
            Ok(Command::Del(key)) => {
                let result = (|| -> Result<(), tessera::Error> {
                    let mut tx = db.begin(true)?;
                    tx.delete(key)?;
                    tx.commit()
                })();
                match result {
                    Ok(()) => println!("ok"),
                    Err(e) => eprintln!("error: {e}"),
                }
            }
            Ok(Command::Scan) => {
                let result = db.view(|tx| tx.iter()?.collect_all());
                match result {
                    Ok(pairs) => {
                        for (key, value) in pairs {
                            println!("{key} -> {}", decode_value(&value));
                        }
                    }
                    Err(e) => eprintln!("error: {e}"),
                }
            }
            Err(message) => eprintln!("error: {message}"),
        }
    }

    if let Err(e) = db.close() {
        eprintln!("error closing database: {e}");
        exit(1);
    }

    Ok(())
}
