// Copyright 2024 The Journal Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! A single-process demonstration broker: the full RPC surface over an
//! in-memory coordination store, with journals self-assigned to this
//! process and fragments persisted through the file driver.

use std::{path::PathBuf, sync::Arc, time::Duration};

use bytes::Bytes;
use clap::Parser;
use journal_broker::{
    allocator::{assignment_key, items_prefix, member_key},
    coord::{Compare, CoordStore, MemCoord, TxnOp},
    Config, Service,
};
use journal_proto::{process_spec::Id, BrokerSpec, ProcessSpec};
use journal_store::{FileStore, MemStore, StoreRegistry};
use prost::Message;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;

type Result<T> = std::result::Result<T, Box<dyn std::error::Error>>;

#[derive(Parser, Debug)]
#[clap(name = "journal-broker", version, about, long_about = None)]
struct Args {
    /// Address to listen on.
    #[clap(long, default_value = "127.0.0.1:8080")]
    listen: String,

    /// Advertised endpoint URL. Defaults to http://{listen}.
    #[clap(long)]
    endpoint: Option<String>,

    /// Failure-domain zone of this process.
    #[clap(long, default_value = "local")]
    zone: String,

    /// Unique process suffix within the zone.
    #[clap(long, default_value = "broker-0")]
    suffix: String,

    /// Keyspace root prefix.
    #[clap(long, default_value = "/journal/demo")]
    root: String,

    /// Coalescing window for keyspace watch responses, in milliseconds.
    #[clap(long, default_value_t = 30)]
    apply_delay_ms: u64,

    /// Pipeline health check interval, in seconds.
    #[clap(long, default_value_t = 60)]
    health_check_secs: u64,

    /// Root directory of the file:// fragment store driver.
    #[clap(long, default_value = "/tmp/journal-fragments")]
    file_store_root: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let id = Id {
        zone: args.zone.clone(),
        suffix: args.suffix.clone(),
    };
    let endpoint = args
        .endpoint
        .clone()
        .unwrap_or_else(|| format!("http://{}", args.listen));

    let coord = Arc::new(MemCoord::new());
    let mut stores = StoreRegistry::new();
    stores.register("file", Arc::new(FileStore::new(&args.file_store_root)));
    stores.register("mem", Arc::new(MemStore::new()));

    let service = Service::new(
        Config {
            id: id.clone(),
            root: args.root.clone(),
            apply_delay: Duration::from_millis(args.apply_delay_ms),
            health_check_interval: Duration::from_secs(args.health_check_secs),
        },
        coord.clone(),
        stores,
    );

    coord.put(
        &member_key(&args.root, &id),
        BrokerSpec {
            process_spec: Some(ProcessSpec {
                id: Some(id.clone()),
                endpoint,
            }),
            journal_limit: 0,
        }
        .encode_to_vec()
        .into(),
    );

    {
        let service = service.clone();
        tokio::spawn(async move {
            if let Err(err) = service.watch().await {
                tracing::error!(%err, "keyspace watch failed");
                std::process::exit(1);
            }
        });
    }
    tokio::spawn(self_assign(coord.clone(), args.root.clone(), id));

    let listener = TcpListener::bind(&args.listen).await?;
    tracing::info!(listen = %args.listen, root = %args.root, "serving journal broker");

    tonic::transport::Server::builder()
        .add_service(service.into_service())
        .serve_with_incoming(TcpListenerStream::new(listener))
        .await?;

    Ok(())
}

/// The demo stand-in for a cluster allocator: every journal is assigned,
/// at its primary slot, to this process.
async fn self_assign(coord: Arc<MemCoord>, root: String, id: Id) {
    let items = items_prefix(&root);
    loop {
        if let Ok(resp) = coord.get_prefix(&items).await {
            for kv in resp.kvs {
                let journal = match kv.key.strip_prefix(&items) {
                    Some(journal) => journal,
                    None => continue,
                };
                let key = assignment_key(&root, journal, &id, 0);
                let _ = coord
                    .txn(
                        vec![Compare {
                            key: key.clone(),
                            mod_revision: 0,
                        }],
                        vec![TxnOp::Put {
                            key,
                            value: Bytes::new(),
                        }],
                    )
                    .await;
            }
        }
        tokio::time::sleep(Duration::from_secs(2)).await;
    }
}
