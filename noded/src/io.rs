//! Task stdio multiplexer.
//!
//! One thread polls every task's stdout/stderr pipe, every attached client
//! socket and a wake pipe. Output is forwarded line by line to all clients;
//! client input goes to the stdin of the target task (or of every task).
//! New clients are handed over through a channel and the wake pipe; they see
//! output from the moment they attach, nothing earlier.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use noded_common::IoHeader;

use crate::task::{cloexec_pipe, ChildStdio};

/// Bytes queued per client before its oldest output is dropped.
pub const CLIENT_QUEUE_LIMIT: usize = 256 * 1024;
const READ_CHUNK: usize = 4096;
/// Partial lines longer than this are forwarded without waiting for `\n`.
const MAX_LINE: usize = 4096;
const FINISH_QUIET: Duration = Duration::from_millis(100);
const FINISH_LIMIT: Duration = Duration::from_secs(2);
const DRAIN_LIMIT: Duration = Duration::from_secs(5);

/// Parent-side ends of one task's pipes.
#[derive(Debug)]
pub struct TaskStreams {
    pub global_id: u32,
    pub stdin: File,
    pub stdout: File,
    pub stderr: File,
}

/// Three pipes for one task: the child ends go over fds 0-2, the parent ends
/// go to the multiplexer.
pub fn task_pipes(global_id: u32) -> io::Result<(ChildStdio, TaskStreams)> {
    let (stdin_read, stdin_write) = cloexec_pipe()?;
    let (stdout_read, stdout_write) = cloexec_pipe()?;
    let (stderr_read, stderr_write) = cloexec_pipe()?;
    Ok((
        ChildStdio {
            stdin: stdin_read,
            stdout: stdout_write,
            stderr: stderr_write,
        },
        TaskStreams {
            global_id,
            stdin: File::from(stdin_write),
            stdout: File::from(stdout_read),
            stderr: File::from(stderr_read),
        },
    ))
}

pub fn connect_client(endpoint: &str, timeout: Duration) -> io::Result<TcpStream> {
    let mut last_err = io::Error::new(io::ErrorKind::InvalidInput, "endpoint has no address");
    for addr in endpoint.to_socket_addrs()? {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => return Ok(stream),
            Err(err) => last_err = err,
        }
    }
    Err(last_err)
}

#[derive(Debug, Clone)]
pub struct MuxOptions {
    pub header: IoHeader,
    /// Prefix every line with `<global task id>: `.
    pub label: bool,
    /// Task receiving client input; `None` broadcasts.
    pub stdin_target: Option<u32>,
}

enum Command {
    Attach(TcpStream),
    Finish,
}

/// Cloneable handle for attaching clients from other threads.
#[derive(Clone)]
pub struct MuxHandle {
    tx: Sender<Command>,
    wake: Arc<File>,
}

impl MuxHandle {
    pub fn attach(&self, stream: TcpStream) -> io::Result<()> {
        self.send(Command::Attach(stream))
    }

    fn send(&self, command: Command) -> io::Result<()> {
        self.tx
            .send(command)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "multiplexer has exited"))?;
        (&*self.wake).write_all(&[1])
    }
}

pub struct IoMux {
    handle: MuxHandle,
    thread: JoinHandle<()>,
}

impl IoMux {
    pub fn start(options: MuxOptions, tasks: Vec<TaskStreams>) -> io::Result<Self> {
        let (wake_read, wake_write) = cloexec_pipe()?;
        set_nonblocking(wake_read.as_raw_fd())?;
        set_nonblocking(wake_write.as_raw_fd())?;
        let (tx, rx) = mpsc::channel();
        let mut state = MuxState::new(options, tasks, wake_read, rx)?;
        let thread = std::thread::Builder::new()
            .name("io-mux".into())
            .spawn(move || state.run())?;
        Ok(Self {
            handle: MuxHandle {
                tx,
                wake: Arc::new(File::from(wake_write)),
            },
            thread,
        })
    }

    pub fn handle(&self) -> MuxHandle {
        self.handle.clone()
    }

    /// Tell the thread every task has exited, then wait for it to flush.
    pub fn finish(self) {
        if let Err(err) = self.handle.send(Command::Finish) {
            debug!(%err, "multiplexer already gone");
        }
        if self.thread.join().is_err() {
            warn!("multiplexer thread panicked");
        }
    }
}

struct Output {
    global_id: u32,
    file: File,
    partial: Vec<u8>,
    open: bool,
}

struct Input {
    global_id: u32,
    file: Option<File>,
    queue: VecDeque<u8>,
    closing: bool,
}

struct Client {
    stream: TcpStream,
    queue: VecDeque<Vec<u8>>,
    /// Bytes of the front chunk already written.
    offset: usize,
    queued: usize,
    reading: bool,
    dead: bool,
}

impl Client {
    fn push(&mut self, chunk: Vec<u8>) {
        if self.queued + chunk.len() > CLIENT_QUEUE_LIMIT {
            let keep = usize::from(self.offset > 0);
            let mut dropped = 0;
            while self.queued + chunk.len() > CLIENT_QUEUE_LIMIT && self.queue.len() > keep {
                if let Some(old) = self.queue.remove(keep) {
                    self.queued -= old.len();
                    dropped += old.len();
                }
            }
            if dropped > 0 {
                let note = format!("-1: dropped {dropped} bytes of output\n").into_bytes();
                self.queued += note.len();
                self.queue.push_back(note);
            }
        }
        self.queued += chunk.len();
        self.queue.push_back(chunk);
    }

    fn flush(&mut self) -> io::Result<()> {
        while let Some(front) = self.queue.front() {
            match self.stream.write(&front[self.offset..]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    self.offset += n;
                    if self.offset == front.len() {
                        self.queued -= front.len();
                        self.offset = 0;
                        self.queue.pop_front();
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}

#[derive(Clone, Copy)]
enum Slot {
    Wake,
    Output(usize),
    Input(usize),
    Client(usize),
}

struct MuxState {
    options: MuxOptions,
    outputs: Vec<Output>,
    inputs: Vec<Input>,
    clients: Vec<Client>,
    wake: File,
    rx: Receiver<Command>,
    finishing: Option<Instant>,
}

impl MuxState {
    fn new(
        options: MuxOptions,
        tasks: Vec<TaskStreams>,
        wake: OwnedFd,
        rx: Receiver<Command>,
    ) -> io::Result<Self> {
        let mut outputs = Vec::with_capacity(tasks.len() * 2);
        let mut inputs = Vec::with_capacity(tasks.len());
        for task in tasks {
            set_nonblocking(task.stdin.as_raw_fd())?;
            for file in [task.stdout, task.stderr] {
                outputs.push(Output {
                    global_id: task.global_id,
                    file,
                    partial: Vec::new(),
                    open: true,
                });
            }
            inputs.push(Input {
                global_id: task.global_id,
                file: Some(task.stdin),
                queue: VecDeque::new(),
                closing: false,
            });
        }
        Ok(Self {
            options,
            outputs,
            inputs,
            clients: Vec::new(),
            wake: File::from(wake),
            rx,
            finishing: None,
        })
    }

    fn run(&mut self) {
        loop {
            let finishing = self.finishing;
            let timeout = match finishing {
                Some(_) => FINISH_QUIET.as_millis() as libc::c_int,
                None => -1,
            };
            let ready = match self.poll(timeout) {
                Ok(ready) => ready,
                Err(err) => {
                    warn!(%err, "poll failed; stopping stdio forwarding");
                    break;
                }
            };
            if let Some(since) = finishing {
                let outputs_done = self.outputs.iter().all(|o| !o.open);
                if ready.is_empty() || outputs_done || since.elapsed() > FINISH_LIMIT {
                    break;
                }
            }
            for (slot, revents) in ready {
                match slot {
                    Slot::Wake => self.on_wake(),
                    Slot::Output(i) => self.on_output(i),
                    Slot::Input(i) => self.on_input(i),
                    Slot::Client(i) => self.on_client(i, revents),
                }
            }
            self.reap_clients();
        }
        self.drain();
    }

    fn poll(&self, timeout: libc::c_int) -> io::Result<Vec<(Slot, libc::c_short)>> {
        let mut fds = Vec::new();
        let mut slots = Vec::new();
        let mut watch = |fd: RawFd, events: libc::c_short, slot: Slot| {
            fds.push(libc::pollfd {
                fd,
                events,
                revents: 0,
            });
            slots.push(slot);
        };

        watch(self.wake.as_raw_fd(), libc::POLLIN, Slot::Wake);
        for (i, output) in self.outputs.iter().enumerate().filter(|(_, o)| o.open) {
            watch(output.file.as_raw_fd(), libc::POLLIN, Slot::Output(i));
        }
        for (i, input) in self.inputs.iter().enumerate() {
            if let Some(file) = input.file.as_ref() {
                if !input.queue.is_empty() {
                    watch(file.as_raw_fd(), libc::POLLOUT, Slot::Input(i));
                }
            }
        }
        for (i, client) in self.clients.iter().enumerate() {
            let mut events = 0;
            if client.reading {
                events |= libc::POLLIN;
            }
            if !client.queue.is_empty() {
                events |= libc::POLLOUT;
            }
            if events != 0 {
                watch(client.stream.as_raw_fd(), events, Slot::Client(i));
            }
        }

        loop {
            // SAFETY: `fds` is a live, correctly sized array of pollfd.
            let n = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout) };
            if n >= 0 {
                break;
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
        Ok(slots
            .into_iter()
            .zip(fds)
            .filter(|(_, fd)| fd.revents != 0)
            .map(|(slot, fd)| (slot, fd.revents))
            .collect())
    }

    fn on_wake(&mut self) {
        let mut buf = [0u8; 64];
        while matches!((&self.wake).read(&mut buf), Ok(n) if n > 0) {}
        loop {
            match self.rx.try_recv() {
                Ok(Command::Attach(stream)) => self.add_client(stream),
                Ok(Command::Finish) => {
                    self.finishing.get_or_insert_with(Instant::now);
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.finishing.get_or_insert_with(Instant::now);
                    break;
                }
            }
        }
    }

    fn add_client(&mut self, stream: TcpStream) {
        if let Err(err) = stream.set_nonblocking(true) {
            warn!(%err, "cannot attach client");
            return;
        }
        let peer = stream.peer_addr().ok();
        let mut client = Client {
            stream,
            queue: VecDeque::new(),
            offset: 0,
            queued: 0,
            reading: true,
            dead: false,
        };
        let mut header = serde_json::to_vec(&self.options.header).unwrap_or_default();
        header.push(b'\n');
        client.push(header);
        debug!(?peer, clients = self.clients.len() + 1, "client attached");
        self.clients.push(client);
    }

    fn on_output(&mut self, i: usize) {
        let mut buf = [0u8; READ_CHUNK];
        let output = &mut self.outputs[i];
        let read = (&output.file).read(&mut buf);
        let mut lines = Vec::new();
        match read {
            Ok(0) => {
                output.open = false;
                if !output.partial.is_empty() {
                    lines.push(std::mem::take(&mut output.partial));
                }
            }
            Ok(n) => {
                output.partial.extend_from_slice(&buf[..n]);
                while let Some(pos) = output.partial.iter().position(|b| *b == b'\n') {
                    lines.push(output.partial.drain(..=pos).collect());
                }
                if output.partial.len() > MAX_LINE {
                    lines.push(std::mem::take(&mut output.partial));
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => {
                debug!(%err, global_id = output.global_id, "task output closed");
                output.open = false;
            }
        }
        let global_id = output.global_id;
        for line in lines {
            self.broadcast(global_id, line);
        }
    }

    fn broadcast(&mut self, global_id: u32, line: Vec<u8>) {
        let chunk = if self.options.label {
            let mut labeled = format!("{global_id}: ").into_bytes();
            labeled.extend_from_slice(&line);
            labeled
        } else {
            line
        };
        for client in self.clients.iter_mut().filter(|c| !c.dead) {
            client.push(chunk.clone());
        }
    }

    fn on_input(&mut self, i: usize) {
        let input = &mut self.inputs[i];
        let Some(file) = input.file.as_ref() else {
            return;
        };
        let (front, _) = input.queue.as_slices();
        match (&*file).write(front) {
            Ok(n) => {
                input.queue.drain(..n);
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => {
                debug!(%err, global_id = input.global_id, "task stdin closed");
                input.queue.clear();
                input.file = None;
            }
        }
        if input.closing && input.queue.is_empty() {
            input.file = None;
        }
    }

    fn on_client(&mut self, i: usize, revents: libc::c_short) {
        if revents & libc::POLLIN != 0 {
            let mut buf = [0u8; READ_CHUNK];
            let read = self.clients[i].stream.read(&mut buf);
            match read {
                Ok(0) => {
                    self.clients[i].reading = false;
                    self.client_stdin_closed();
                }
                Ok(n) => self.route_stdin(&buf[..n]),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    debug!(%err, "client read failed");
                    self.clients[i].dead = true;
                }
            }
        }
        if revents & libc::POLLOUT != 0 && !self.clients[i].dead {
            if let Err(err) = self.clients[i].flush() {
                debug!(%err, "client write failed; dropping client");
                self.clients[i].dead = true;
            }
        }
        if revents & (libc::POLLERR | libc::POLLNVAL) != 0 {
            self.clients[i].dead = true;
        }
    }

    fn route_stdin(&mut self, data: &[u8]) {
        let target = self.options.stdin_target;
        for input in self
            .inputs
            .iter_mut()
            .filter(|input| input.file.is_some() && !input.closing)
            .filter(|input| target.map_or(true, |gid| gid == input.global_id))
        {
            input.queue.extend(data);
        }
    }

    /// Task stdin closes once no attached client can still send input.
    fn client_stdin_closed(&mut self) {
        if self.clients.iter().any(|c| c.reading && !c.dead) {
            return;
        }
        for input in &mut self.inputs {
            input.closing = true;
            if input.queue.is_empty() {
                input.file = None;
            }
        }
    }

    fn reap_clients(&mut self) {
        let before = self.clients.len();
        self.clients.retain(|c| !c.dead);
        if self.clients.len() != before {
            debug!(clients = self.clients.len(), "client detached");
            self.client_stdin_closed();
        }
    }

    fn drain(&mut self) {
        for input in &mut self.inputs {
            input.file = None;
        }
        let deadline = Instant::now() + DRAIN_LIMIT;
        for client in &mut self.clients {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let _ = client.stream.set_nonblocking(false);
            let _ = client.stream.set_write_timeout(Some(remaining));
            if let Err(err) = client.flush() {
                debug!(%err, "could not flush client at exit");
            }
            let _ = client.stream.shutdown(Shutdown::Write);
        }
        self.clients.clear();
    }
}

pub fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    // SAFETY: fcntl on a descriptor we own; flags are read before being set.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader};
    use std::net::TcpListener;

    fn header() -> IoHeader {
        IoHeader {
            job_id: 7,
            step_id: 1,
            node_id: 0,
        }
    }

    /// A fake task: the test keeps the child ends and plays the program.
    fn fake_task(global_id: u32) -> (ChildStdio, TaskStreams) {
        task_pipes(global_id).unwrap()
    }

    fn accept_pair(listener: &TcpListener) -> (TcpStream, TcpStream) {
        let addr = listener.local_addr().unwrap().to_string();
        let client = connect_client(&addr, Duration::from_secs(1)).unwrap();
        let (server, _) = listener.accept().unwrap();
        (server, client)
    }

    fn read_line(reader: &mut BufReader<TcpStream>) -> String {
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        line
    }

    #[test]
    fn labels_lines_and_routes_stdin() {
        let (child, streams) = fake_task(4);
        let mux = IoMux::start(
            MuxOptions {
                header: header(),
                label: true,
                stdin_target: None,
            },
            vec![streams],
        )
        .unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let (mux_side, client) = accept_pair(&listener);
        mux.handle().attach(mux_side).unwrap();
        client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut reader = BufReader::new(client.try_clone().unwrap());

        let header: IoHeader = serde_json::from_str(&read_line(&mut reader)).unwrap();
        assert_eq!(header.job_id, 7);

        let mut task_out = File::from(child.stdout);
        task_out.write_all(b"hello\nwor").unwrap();
        assert_eq!(read_line(&mut reader), "4: hello\n");

        (&client).write_all(b"typed\n").unwrap();
        let mut task_in = File::from(child.stdin);
        let mut buf = [0u8; 6];
        task_in.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"typed\n");

        // EOF flushes the partial line, unterminated, before the client is
        // shut down.
        drop(task_out);
        drop(child.stderr);
        mux.finish();
        let mut rest = String::new();
        reader.read_to_string(&mut rest).unwrap();
        assert_eq!(rest, "4: wor");
    }

    #[test]
    fn late_client_sees_only_new_output() {
        let (child, streams) = fake_task(0);
        let mux = IoMux::start(
            MuxOptions {
                header: header(),
                label: false,
                stdin_target: Some(0),
            },
            vec![streams],
        )
        .unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();

        let (a_side, a) = accept_pair(&listener);
        mux.handle().attach(a_side).unwrap();
        a.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut a_reader = BufReader::new(a.try_clone().unwrap());
        read_line(&mut a_reader);

        let mut task_out = File::from(child.stdout);
        task_out.write_all(b"one\n").unwrap();
        assert_eq!(read_line(&mut a_reader), "one\n");

        let (b_side, b) = accept_pair(&listener);
        mux.handle().attach(b_side).unwrap();
        b.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut b_reader = BufReader::new(b.try_clone().unwrap());
        read_line(&mut b_reader);

        task_out.write_all(b"two\n").unwrap();
        assert_eq!(read_line(&mut b_reader), "two\n");
        assert_eq!(read_line(&mut a_reader), "two\n");

        // The first client leaving does not disturb the second.
        drop(a_reader);
        drop(a);
        task_out.write_all(b"three\n").unwrap();
        assert_eq!(read_line(&mut b_reader), "three\n");

        drop(task_out);
        drop(child.stderr);
        mux.finish();
    }

    #[test]
    fn stdin_closes_when_last_client_stops_sending() {
        let (child, streams) = fake_task(0);
        let mux = IoMux::start(
            MuxOptions {
                header: header(),
                label: false,
                stdin_target: None,
            },
            vec![streams],
        )
        .unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let (side, client) = accept_pair(&listener);
        mux.handle().attach(side).unwrap();

        (&client).write_all(b"last words\n").unwrap();
        client.shutdown(Shutdown::Write).unwrap();

        let mut task_in = File::from(child.stdin);
        let mut received = String::new();
        task_in.read_to_string(&mut received).unwrap();
        assert_eq!(received, "last words\n");

        drop(child.stdout);
        drop(child.stderr);
        mux.finish();
    }

    #[test]
    fn overflowing_queue_drops_oldest_and_notes_it() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let (side, _client) = accept_pair(&listener);
        let mut client = Client {
            stream: side,
            queue: VecDeque::new(),
            offset: 0,
            queued: 0,
            reading: true,
            dead: false,
        };
        let chunk = vec![b'x'; CLIENT_QUEUE_LIMIT / 2];
        client.push(chunk.clone());
        client.push(chunk.clone());
        client.push(chunk);
        assert!(client.queued <= CLIENT_QUEUE_LIMIT + 64);
        let note = client
            .queue
            .iter()
            .find(|c| c.starts_with(b"-1: "))
            .expect("diagnostic line");
        assert!(String::from_utf8_lossy(note).contains("dropped"));
    }
}
