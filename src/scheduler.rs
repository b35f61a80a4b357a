use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};

use crate::handler::RequestHandler;

enum Job {
    Terminal {
        stream: TcpStream,
        client_ip: String,
    },
    Chained {
        stream: TcpStream,
        client_ip: String,
        proxy_server: String,
        proxy_port: u16,
    },
}

/// Fire-and-forget dispatch of accepted connections onto a fixed pool of
/// worker tasks. The queue is unbounded; each worker runs one exchange to
/// completion before pulling the next. Nothing is awaited, cancelled, or
/// reported back to the acceptor.
pub struct Scheduler {
    queue: mpsc::UnboundedSender<Job>,
}

impl Scheduler {
    pub fn new(handler: Arc<RequestHandler>, workers: usize) -> Self {
        let (queue, rx) = mpsc::unbounded_channel::<Job>();
        let rx = Arc::new(Mutex::new(rx));
        for id in 0..workers.max(1) {
            let rx = Arc::clone(&rx);
            let handler = Arc::clone(&handler);
            tokio::spawn(async move {
                loop {
                    let job = rx.lock().await.recv().await;
                    let Some(job) = job else {
                        break;
                    };
                    match job {
                        Job::Terminal { stream, client_ip } => {
                            handler.service_request(stream, client_ip).await;
                        }
                        Job::Chained {
                            stream,
                            client_ip,
                            proxy_server,
                            proxy_port,
                        } => {
                            handler
                                .service_chained(stream, client_ip, &proxy_server, proxy_port)
                                .await;
                        }
                    }
                }
                log::debug!("worker {id} stopped");
            });
        }
        Self { queue }
    }

    pub fn schedule_request(&self, stream: TcpStream, client_ip: String) {
        self.enqueue(Job::Terminal { stream, client_ip });
    }

    pub fn schedule_chained(
        &self,
        stream: TcpStream,
        client_ip: String,
        proxy_server: String,
        proxy_port: u16,
    ) {
        self.enqueue(Job::Chained {
            stream,
            client_ip,
            proxy_server,
            proxy_port,
        });
    }

    fn enqueue(&self, job: Job) {
        if self.queue.send(job).is_err() {
            log::warn!("dispatch queue closed, dropping connection");
        }
    }
}
