//! Child-side half of the protocol: read tagged commands, dispatch them to handlers,
//! write tagged replies.

use std::{collections::HashMap, fmt, future::Future, io, pin::Pin, sync::Arc};

use serde_json::Value;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    sync::Mutex,
    task::JoinSet,
};
use tracing::{debug, warn};

use crate::codec::{self, Tag};

type HandlerFuture = Pin<Box<dyn Future<Output = Option<Value>> + Send>>;
type Handler = Arc<dyn Fn(Value) -> HandlerFuture + Send + Sync>;

/// Dispatches incoming commands to registered handlers.
///
/// Each command runs on its own task, so slow handlers do not hold up the rest and
/// replies may leave out of order. Malformed lines and unknown commands get no reply.
#[derive(Clone, Default)]
pub struct Responder {
    handlers: HashMap<String, Handler>,
}

impl fmt::Debug for Responder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut commands: Vec<_> = self.handlers.keys().collect();
        commands.sort();
        f.debug_struct("Responder")
            .field("commands", &commands)
            .finish()
    }
}

impl Responder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `name`. A handler returning `None` is answered with an
    /// empty object.
    pub fn command<F, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<Value>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |ext| Box::pin(handler(ext)) as HandlerFuture);
        self.handlers.insert(name.into(), handler);
        self
    }

    pub fn handles(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Serves requests read from `input` until it ends, then waits for in-flight
    /// handlers to reply before returning.
    pub async fn serve<R, W>(&self, input: R, output: W) -> io::Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let output = Arc::new(Mutex::new(output));
        let mut lines = BufReader::new(input).lines();
        let mut in_flight = JoinSet::new();

        while let Some(line) = lines.next_line().await? {
            let Some(request) = codec::decode_request(&line) else {
                debug!("ignoring malformed request line");
                continue;
            };
            let Some(handler) = self.handlers.get(&request.command).cloned() else {
                debug!(command = %request.command, "ignoring unknown command");
                continue;
            };

            let output = output.clone();
            in_flight.spawn(async move {
                let extension = handler(request.extension)
                    .await
                    .unwrap_or_else(|| Value::Object(Default::default()));
                write_reply(&output, request.tag, &extension).await
            });

            while let Some(done) = in_flight.try_join_next() {
                log_handler_result(done);
            }
        }

        while let Some(done) = in_flight.join_next().await {
            log_handler_result(done);
        }

        let mut output = output.lock().await;
        output.flush().await
    }

    /// Serves requests on this process's own stdin/stdout.
    pub async fn serve_stdio(&self) -> io::Result<()> {
        self.serve(tokio::io::stdin(), tokio::io::stdout()).await
    }
}

async fn write_reply<W>(output: &Mutex<W>, tag: Tag, extension: &Value) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let line = codec::encode_reply(tag, extension)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    let mut output = output.lock().await;
    output.write_all(line.as_bytes()).await?;
    output.flush().await
}

fn log_handler_result(result: Result<io::Result<()>, tokio::task::JoinError>) {
    match result {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!("failed to write reply: {err}"),
        Err(err) => warn!("command handler failed: {err}"),
    }
}
