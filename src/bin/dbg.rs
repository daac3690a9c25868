use std::error::Error;
use std::fs;
use std::io::{self, BufRead, Write as _};
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use vtk_pos::codec;
use vtk_pos::msg::{Message, PROTO_POS, PROTO_VMC};
use vtk_pos::net::{Connection, NetState};
use vtk_pos::stream::ByteStream;

const SYNTAX_ERR: &str = "unexpected command; type \"help\" to check syntax";

const HELP: &str = "
Network commands, server mode:
    net list 0.0.0.0 1234
       start to listen on port 1234, from all IPs
    net accept
       accept one pending connection on the listening socket
    net drop
       drop remote connection, continue to listen for new one, if applicable
    net down
       drop remote connection, stop to listen, if applicable
    net conn 127.0.0.1 1234
       conn to 127.0.0.1, on port 1234
    net stat
       show current net state

Message commands:
    msg reset [POS | VMC]
       reset / initialize the upload message structure
    msg addstr 1 IDL
       add new field to the upload message, with id 0x01 and value \"IDL\"
    msg addhex d 00ff17
       add new field with id 0x0d and the given raw bytes
    msg print
       show the upload message in human readable form
    msg printhex
       show the upload message in hex form
    msg send
       send the message over TCP, if connected; the message is reset then
    recv [timeout_ms]
       wait for one incoming message and show it (5000 ms by default)

Other commands:
    macro sample0.macro
       load commands from \"sample0.macro\" and execute them
       as if they were read from terminal
    help
       show this help
    quit
       quit gracefully
";

/// Interactive console for poking a Vendotek peer by hand, either as
/// the connecting or the accepting side.
#[derive(Parser)]
#[command(name = "vtk-dbg")]
struct Cli {
    /// Increase verbosity (-v: state changes, -vv: wire dumps)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

struct Repl {
    conn: Connection,
    msg_up: Message,
    msg_down: Message,
    scratch: ByteStream,
}

impl Repl {
    fn new() -> Self {
        Self {
            conn: Connection::new(),
            msg_up: Message::new(PROTO_VMC),
            msg_down: Message::new(PROTO_VMC),
            scratch: ByteStream::new(),
        }
    }

    fn dispatch(&mut self, line: &str) -> Result<(), Box<dyn Error>> {
        let args: Vec<&str> = line.split_whitespace().collect();
        match args.as_slice() {
            ["net", rest @ ..] => self.net_command(rest),
            ["msg", rest @ ..] => self.msg_command(rest),
            ["recv"] => self.recv_command(5000),
            ["recv", ms] => self.recv_command(ms.parse()?),
            ["macro", path] => self.play_macro(path),
            _ => Err(SYNTAX_ERR.into()),
        }
    }

    fn net_command(&mut self, args: &[&str]) -> Result<(), Box<dyn Error>> {
        match args {
            ["conn", addr, port] => self.conn.connect(addr, port)?,
            ["list", addr, port] => self.conn.listen(addr, port)?,
            ["accept"] => self.conn.accept()?,
            ["drop"] => {
                if self.conn.state() == NetState::Accepted {
                    self.conn.drop_peer()?;
                } else {
                    self.conn.shutdown()?;
                }
            }
            ["down"] => self.conn.shutdown()?,
            ["stat"] => println!("current state: {}", self.conn.state()),
            _ => return Err(SYNTAX_ERR.into()),
        }
        Ok(())
    }

    fn msg_command(&mut self, args: &[&str]) -> Result<(), Box<dyn Error>> {
        match args {
            ["reset"] => self.msg_up.reset(self.conn.base_proto()),
            ["reset", role] => {
                let proto = match role.to_ascii_lowercase().as_str() {
                    "vmc" => PROTO_VMC,
                    "pos" => PROTO_POS,
                    _ => return Err(SYNTAX_ERR.into()),
                };
                self.msg_up.reset(proto);
            }
            ["addstr", id, value @ ..] if !value.is_empty() => {
                self.msg_up.append_str(parse_arg_id(id)?, &value.join(" "))?;
            }
            ["addhex", id, bytes] => {
                self.msg_up.append_bin(parse_arg_id(id)?, &hex::decode(bytes)?)?;
            }
            ["print"] => print!("{}", self.msg_up),
            ["printhex"] => {
                codec::serialize(&self.msg_up, &mut self.scratch);
                println!("{}", hex::encode(self.scratch.as_bytes()));
            }
            ["send"] => {
                self.conn.send(&self.msg_up)?;
                self.msg_up.reset(self.conn.base_proto());
            }
            _ => return Err(SYNTAX_ERR.into()),
        }
        Ok(())
    }

    fn recv_command(&mut self, timeout_ms: u64) -> Result<(), Box<dyn Error>> {
        let eof = self
            .conn
            .recv(&mut self.msg_down, Duration::from_millis(timeout_ms))?;
        print!("{}", self.msg_down);

        if eof {
            let state = self.conn.state();
            println!("EOF was found on {state} socket, closing it");
            match state {
                NetState::Accepted => self.conn.drop_peer()?,
                _ => self.conn.shutdown()?,
            }
        }
        Ok(())
    }

    fn play_macro(&mut self, path: &str) -> Result<(), Box<dyn Error>> {
        let script = fs::read_to_string(path)
            .map_err(|e| format!("can't open {path} macro file for read: {e}"))?;
        for line in script.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            println!("macro > {line}");
            if let Err(e) = self.dispatch(line) {
                eprintln!("{e}");
            }
        }
        Ok(())
    }
}

/// Argument ids are given in hex, with or without the 0x prefix.
fn parse_arg_id(s: &str) -> Result<u16, Box<dyn Error>> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    u16::from_str_radix(digits, 16).map_err(|_| SYNTAX_ERR.into())
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .init();

    let mut repl = Repl::new();
    let stdin = io::stdin();

    loop {
        print!("command > ");
        io::stdout().flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break; // stdin closed
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line.eq_ignore_ascii_case("help") {
            println!("{HELP}");
            continue;
        }
        if line.eq_ignore_ascii_case("quit") {
            break;
        }
        if let Err(e) = repl.dispatch(line) {
            eprintln!("{e}");
        }
    }
    Ok(())
}
