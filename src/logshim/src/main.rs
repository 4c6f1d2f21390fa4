//! logshim: frame a child's stdout/stderr lines as JSON records.
//!
//! Runs the given command, reads both output streams line by line, and
//! emits one `{"log": "<line>\n", "stream": "stdout|stderr", "time": …}`
//! record per line on its own stdout. A mutex keeps records atomic so the
//! newline-delimited JSON stream never interleaves. Exits with the child's
//! exit code.

use std::io::{BufRead, BufReader, Read, Write};
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex};

use serde::Serialize;

#[derive(Serialize)]
struct LogEntry {
    log: String,
    stream: &'static str,
    time: String,
}

fn stream_loop(out: Arc<Mutex<std::io::Stdout>>, stream: impl Read, stream_name: &'static str) {
    let reader = BufReader::new(stream);
    for line in reader.lines() {
        let line = match line {
            Ok(line) => line,
            Err(_) => break,
        };
        let entry = LogEntry {
            log: format!("{}\n", line),
            stream: stream_name,
            time: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Nanos, true),
        };
        let buf = match serde_json::to_string(&entry) {
            Ok(buf) => buf,
            Err(err) => {
                eprintln!("logshim: failed to marshal record: {}", err);
                std::process::exit(1);
            }
        };
        let mut out = out.lock().expect("output mutex poisoned");
        if writeln!(out, "{}", buf).is_err() {
            std::process::exit(1);
        }
    }
}

fn main() {
    let mut args = std::env::args_os().skip(1);
    let Some(command) = args.next() else {
        eprintln!("usage: logshim <command> [args...]");
        std::process::exit(1);
    };

    let mut cmd = Command::new(&command);
    cmd.args(args).stdout(Stdio::piped()).stderr(Stdio::piped());

    // Die with the parent: the framer must never outlive its container.
    unsafe {
        cmd.pre_exec(|| {
            if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(err) => {
            eprintln!(
                "logshim: failed to start {}: {}",
                command.to_string_lossy(),
                err
            );
            std::process::exit(1);
        }
    };

    let stdout = child.stdout.take().expect("stdout is piped");
    let stderr = child.stderr.take().expect("stderr is piped");

    let out = Arc::new(Mutex::new(std::io::stdout()));
    let out_stdout = out.clone();
    let out_stderr = out;

    let stdout_thread = std::thread::spawn(move || stream_loop(out_stdout, stdout, "stdout"));
    let stderr_thread = std::thread::spawn(move || stream_loop(out_stderr, stderr, "stderr"));

    let status = match child.wait() {
        Ok(status) => status,
        Err(err) => {
            eprintln!("logshim: failed to wait for child: {}", err);
            std::process::exit(1);
        }
    };

    let _ = stdout_thread.join();
    let _ = stderr_thread.join();

    std::process::exit(status.code().unwrap_or(1));
}
