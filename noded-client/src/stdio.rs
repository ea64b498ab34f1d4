//! Task stdio endpoint of a launch client.
//!
//! A step manager connects here, writes one [`IoHeader`] JSON line and then
//! streams task output as text lines. Bytes written back are task stdin.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;

use noded_common::IoHeader;

pub struct IoListener {
    listener: TcpListener,
}

impl IoListener {
    pub async fn bind() -> io::Result<Self> {
        Ok(Self {
            listener: TcpListener::bind("127.0.0.1:0").await?,
        })
    }

    pub fn addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn endpoint(&self) -> io::Result<String> {
        Ok(self.addr()?.to_string())
    }

    /// Next manager connection, with its header already read.
    pub async fn accept(&self, limit: Duration) -> io::Result<IoStream> {
        let (stream, _) = tokio::time::timeout(limit, self.listener.accept())
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "no stdio connection"))??;
        let (reader, writer) = stream.into_split();
        let mut stream = IoStream {
            reader: BufReader::new(reader),
            writer: Some(writer),
            header: None,
        };
        let line = stream
            .read_line(limit)
            .await?
            .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "no stdio header"))?;
        let header: IoHeader = serde_json::from_str(&line)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        stream.header = Some(header);
        Ok(stream)
    }
}

pub struct IoStream {
    reader: BufReader<OwnedReadHalf>,
    writer: Option<OwnedWriteHalf>,
    header: Option<IoHeader>,
}

impl IoStream {
    pub fn header(&self) -> Option<&IoHeader> {
        self.header.as_ref()
    }

    /// Next output line without its newline; `None` at end of stream.
    pub async fn read_line(&mut self, limit: Duration) -> io::Result<Option<String>> {
        let mut line = String::new();
        let read = tokio::time::timeout(limit, self.reader.read_line(&mut line))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "no output"))??;
        if read == 0 {
            return Ok(None);
        }
        Ok(Some(line.trim_end_matches('\n').to_string()))
    }

    /// Every line until the manager closes the connection.
    pub async fn read_to_end(&mut self, limit: Duration) -> io::Result<Vec<String>> {
        let deadline = tokio::time::Instant::now() + limit;
        let mut lines = Vec::new();
        loop {
            let left = deadline.saturating_duration_since(tokio::time::Instant::now());
            match self.read_line(left).await? {
                Some(line) => lines.push(line),
                None => return Ok(lines),
            }
        }
    }

    pub async fn write_stdin(&mut self, data: &[u8]) -> io::Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "stdin closed"))?;
        writer.write_all(data).await?;
        writer.flush().await
    }

    /// Half-close: tasks see EOF on stdin, output keeps flowing.
    pub async fn close_stdin(&mut self) -> io::Result<()> {
        match self.writer.take() {
            Some(mut writer) => writer.shutdown().await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn header_then_lines() {
        let listener = IoListener::bind().await.unwrap();
        let addr = listener.addr().unwrap();
        let writer = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream
                .write_all(b"{\"job_id\":7,\"step_id\":1,\"node_id\":0}\n0: hello\n1: world\n")
                .await
                .unwrap();
        });
        let mut stream = listener.accept(Duration::from_secs(5)).await.unwrap();
        assert_eq!(stream.header().unwrap().job_id, 7);
        let lines = stream.read_to_end(Duration::from_secs(5)).await.unwrap();
        assert_eq!(lines, vec!["0: hello", "1: world"]);
        writer.await.unwrap();
    }
}
