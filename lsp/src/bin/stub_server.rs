//! Stand-in for the YARA language server, used by the integration tests.
//!
//! Installed as the environment's runtime executable, it answers both roles the
//! supervisor uses that executable for:
//! - `-m pip list` prints a package listing that includes the server package.
//! - `<entrypoint> <host> <port>` serves over TCP, `<entrypoint> --stdio` over
//!   stdin/stdout, `<entrypoint> --pipe <path>` over a unix socket.
//!
//! An entrypoint path containing `exit_early` exits with status 3 before binding.
//! One containing `slow_bind` waits before binding.

use std::io;
use std::process::ExitCode;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::io::{AsyncRead, AsyncWrite};
use yls_lsp::codec::{FrameReader, FrameWriter};

const SLOW_BIND_DELAY: Duration = Duration::from_secs(3);

#[derive(Debug, PartialEq, Eq)]
enum Outcome {
    Exit,
    Disconnected,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();

    if args.first().map(String::as_str) == Some("-m") {
        println!("Package    Version");
        println!("---------- -------");
        println!("pip        24.0");
        println!("yarals     1.2.0");
        return ExitCode::SUCCESS;
    }

    let Some(entrypoint) = args.first() else {
        eprintln!("usage: yls-stub-server <entrypoint> (<host> <port> | --stdio | --pipe <path>)");
        return ExitCode::from(2);
    };
    if entrypoint.contains("exit_early") {
        eprintln!("server crashed on start");
        return ExitCode::from(3);
    }
    if entrypoint.contains("slow_bind") {
        tokio::time::sleep(SLOW_BIND_DELAY).await;
    }

    let result = match args.get(1).map(String::as_str) {
        Some("--stdio") => {
            eprintln!("serving on stdio");
            serve(tokio::io::stdin(), tokio::io::stdout())
                .await
                .map(|_| ())
        }
        Some("--pipe") => serve_pipe(args.get(2)).await,
        Some(host) => serve_tcp(host, args.get(2)).await,
        None => Err(io::Error::other("missing transport arguments")),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("stub server: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn serve_tcp(host: &str, port: Option<&String>) -> io::Result<()> {
    let port: u16 = port
        .and_then(|p| p.parse().ok())
        .ok_or_else(|| io::Error::other("missing or invalid port"))?;
    let listener = tokio::net::TcpListener::bind((host, port)).await?;
    eprintln!("serving on {host}:{port}");

    // Readiness probes connect and hang up without sending anything.
    loop {
        let (stream, _) = listener.accept().await?;
        let (reader, writer) = stream.into_split();
        if serve(reader, writer).await? == Outcome::Exit {
            return Ok(());
        }
    }
}

#[cfg(unix)]
async fn serve_pipe(path: Option<&String>) -> io::Result<()> {
    let path = path.ok_or_else(|| io::Error::other("missing pipe path"))?;
    let listener = tokio::net::UnixListener::bind(path)?;
    eprintln!("serving on {path}");

    loop {
        let (stream, _) = listener.accept().await?;
        let (reader, writer) = stream.into_split();
        if serve(reader, writer).await? == Outcome::Exit {
            let _ = std::fs::remove_file(path);
            return Ok(());
        }
    }
}

#[cfg(not(unix))]
async fn serve_pipe(_path: Option<&String>) -> io::Result<()> {
    Err(io::Error::other("pipe transport is only stubbed on unix"))
}

async fn serve<R, W>(reader: R, writer: W) -> io::Result<Outcome>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut reader = FrameReader::new(reader);
    let mut writer = FrameWriter::new(writer);
    let mut compile_on_save = false;

    loop {
        let frame = match reader.read_frame().await {
            Ok(Some(frame)) => frame,
            Ok(None) => return Ok(Outcome::Disconnected),
            Err(e) => return Err(io::Error::other(e)),
        };
        let method = frame.get("method").and_then(Value::as_str).unwrap_or("");
        let id = frame.get("id").cloned();

        let outgoing = match (method, id) {
            ("initialize", Some(id)) => Some(result(
                &id,
                json!({
                    "capabilities": {
                        "textDocumentSync": 1,
                        "executeCommandProvider": {
                            "commands": ["yara.CompileRule", "yara.CompileAllRules"]
                        }
                    },
                    "serverInfo": { "name": "yarals-stub" }
                }),
            )),
            ("initialized", None) => Some(json!({
                "jsonrpc": "2.0",
                "method": "window/showMessageRequest",
                "params": { "type": 3, "message": "Successfully connected" }
            })),
            ("shutdown", Some(id)) => Some(result(&id, Value::Null)),
            ("exit", None) => return Ok(Outcome::Exit),
            ("workspace/executeCommand", Some(id)) => Some(result(&id, Value::Null)),
            ("workspace/didChangeConfiguration", None) => {
                compile_on_save = frame["params"]["settings"]["yara"]["compile_on_save"]
                    .as_bool()
                    .unwrap_or(false);
                None
            }
            ("textDocument/didSave", None) if compile_on_save => {
                let uri = frame["params"]["textDocument"]["uri"].clone();
                Some(json!({
                    "jsonrpc": "2.0",
                    "method": "textDocument/publishDiagnostics",
                    "params": {
                        "uri": uri,
                        "diagnostics": [{
                            "range": {
                                "start": { "line": 0, "character": 0 },
                                "end": { "line": 0, "character": 4 }
                            },
                            "severity": 1,
                            "source": "yara",
                            "message": "syntax error, unexpected end of file"
                        }]
                    }
                }))
            }
            (other, Some(id)) => Some(json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": { "code": -32601, "message": format!("Method not found: {other}") }
            })),
            _ => None,
        };

        if let Some(message) = outgoing {
            writer.write_frame(&message).await.map_err(io::Error::other)?;
        }
    }
}

fn result(id: &Value, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}
