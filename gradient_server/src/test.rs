#![cfg(test)]

use std::sync::Arc;

use comms::{
    OnoReceiver, OnoSender,
    msg::{Command, Msg, Payload},
    specs::server::CheckpointSpec,
};
use rand::{SeedableRng, rngs::StdRng};
use tokio::{
    io::{self, AsyncRead, AsyncWrite, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf},
    sync::Barrier,
};

use crate::{
    initialization::{ParamGen, RandParamGen},
    service::{GradientServer, ParameterServer, SERVER_RANK},
    sparsification::{RetentionRate, TopK},
    storage::{GradientWarehouse, VectorBuffer},
    tracking::CheckpointPolicy,
};

type Channel = (
    OnoReceiver<ReadHalf<DuplexStream>>,
    OnoSender<WriteHalf<DuplexStream>>,
);

const PARAMS: usize = 4;

fn channel_pair() -> (Channel, Channel) {
    let (stream1, stream2) = io::duplex(4096);
    let (rx1, tx1) = io::split(stream1);
    let (rx2, tx2) = io::split(stream2);
    let chan1 = comms::channel(rx1, tx1);
    let chan2 = comms::channel(rx2, tx2);
    (chan1, chan2)
}

fn create_server(workers: usize, checkpoint: CheckpointSpec) -> ParameterServer<TopK> {
    create_server_from(VectorBuffer::zeros(PARAMS), workers, checkpoint)
}

fn create_server_from(
    initial: VectorBuffer,
    workers: usize,
    checkpoint: CheckpointSpec,
) -> ParameterServer<TopK> {
    let warehouse = GradientWarehouse::new(initial);
    let policy = CheckpointPolicy::new(&checkpoint, workers).unwrap();
    let rate = RetentionRate::new(0.5).unwrap();
    let server = GradientServer::new(warehouse, workers, policy, TopK, rate, 0.1);
    ParameterServer::new(server)
}

fn no_checkpoints() -> CheckpointSpec {
    CheckpointSpec {
        warmup: u64::MAX,
        ..Default::default()
    }
}

async fn send_sparse<W>(
    tx: &mut OnoSender<W>,
    rank: u32,
    version: u64,
    indices: &[u32],
    values: &[f32],
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let msg = Msg::Data {
        sender: rank,
        version,
        payload: Payload::SparseGradient {
            lr: 0.,
            indices,
            values,
        },
    };

    tx.send(&msg).await
}

/// Receives the server's reply and applies it onto `local`.
///
/// # Returns
/// The kind of the received payload.
async fn recv_into_model<R>(
    rx: &mut OnoReceiver<R>,
    rx_buf: &mut Vec<f32>,
    local: &mut VectorBuffer,
) -> io::Result<&'static str>
where
    R: AsyncRead + Unpin,
{
    let (sender, payload) = match rx.recv_into(rx_buf).await? {
        Msg::Data {
            sender, payload, ..
        } => (sender, payload),
        other => panic!("expected a data message, got {other:?}"),
    };

    assert_eq!(sender, SERVER_RANK);

    let kind = payload.kind();
    match payload {
        Payload::Model(params) => local.copy_from(params)?,
        Payload::SparseGradient {
            indices, values, ..
        } => {
            let local = local.as_mut_slice();
            for (&i, &v) in indices.iter().zip(values) {
                local[i as usize] += v;
            }
        }
        other => panic!("unexpected reply {other:?}"),
    }

    Ok(kind)
}

async fn disconnect<R, W>(rx: &mut OnoReceiver<R>, tx: &mut OnoSender<W>) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut rx_buf: Vec<u32> = Vec::new();

    tx.send(&Msg::Control(Command::Disconnect)).await?;
    while !matches!(
        rx.recv_into(&mut rx_buf).await?,
        Msg::Control(Command::Disconnect)
    ) {}

    Ok(())
}

async fn mock_sparse_worker<R, W>(
    mut rx: OnoReceiver<R>,
    mut tx: OnoSender<W>,
    rank: u32,
    updates: &[(u32, f32)],
    barrier: Arc<Barrier>,
) -> io::Result<Vec<f32>>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    const CATCH_UP_ROUNDS: usize = 3;

    let mut rx_buf = Vec::new();
    let mut local = VectorBuffer::zeros(PARAMS);
    let mut version = 0;

    let kind = recv_into_model(&mut rx, &mut rx_buf, &mut local).await?;
    assert_eq!(kind, "ModelUpdate");

    for &(index, value) in updates {
        version += 1;
        send_sparse(&mut tx, rank, version, &[index], &[value]).await?;
        recv_into_model(&mut rx, &mut rx_buf, &mut local).await?;
    }

    barrier.wait().await;

    for _ in 0..CATCH_UP_ROUNDS {
        version += 1;
        send_sparse(&mut tx, rank, version, &[], &[]).await?;
        recv_into_model(&mut rx, &mut rx_buf, &mut local).await?;
    }

    disconnect(&mut rx, &mut tx).await?;
    Ok(local.into_vec())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_workers_converge_to_global_model() -> io::Result<()> {
    let ((wk1_rx, wk1_tx), (sv1_rx, sv1_tx)) = channel_pair();
    let ((wk2_rx, wk2_tx), (sv2_rx, sv2_tx)) = channel_pair();

    let mut server = create_server(3, no_checkpoints());
    server.spawn(sv1_rx, sv1_tx);
    server.spawn(sv2_rx, sv2_tx);

    let barrier = Arc::new(Barrier::new(2));
    let updates1 = [(0, 1.), (1, 2.), (0, 0.5)];
    let updates2 = [(2, 1.), (3, -2.), (1, 0.5)];

    let worker1 = mock_sparse_worker(wk1_rx, wk1_tx, 1, &updates1, Arc::clone(&barrier));
    let worker2 = mock_sparse_worker(wk2_rx, wk2_tx, 2, &updates2, barrier);
    let server_fut = async { Ok(server.run().await) };

    let (local1, local2, global) = tokio::try_join!(worker1, worker2, server_fut)?;

    let expected = vec![-1.5, -2.5, -1., 2.];
    assert_eq!(global.into_vec(), expected);
    assert_eq!(local1, expected);
    assert_eq!(local2, expected);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_workers_start_from_a_random_model() -> io::Result<()> {
    let ((wk1_rx, wk1_tx), (sv1_rx, sv1_tx)) = channel_pair();
    let ((wk2_rx, wk2_tx), (sv2_rx, sv2_tx)) = channel_pair();

    let rng = StdRng::seed_from_u64(42);
    let initial = RandParamGen::uniform(rng, -1., 1.).unwrap().generate(PARAMS);
    let initial = VectorBuffer::from(initial);

    let mut server = create_server_from(initial.clone(), 3, no_checkpoints());
    server.spawn(sv1_rx, sv1_tx);
    server.spawn(sv2_rx, sv2_tx);

    let barrier = Arc::new(Barrier::new(2));
    let updates1 = [(0, 1.), (2, 0.25)];
    let updates2 = [(3, -2.), (0, 0.5)];

    let worker1 = mock_sparse_worker(wk1_rx, wk1_tx, 1, &updates1, Arc::clone(&barrier));
    let worker2 = mock_sparse_worker(wk2_rx, wk2_tx, 2, &updates2, barrier);
    let server_fut = async { Ok(server.run().await) };

    let (local1, local2, global) = tokio::try_join!(worker1, worker2, server_fut)?;

    let expected = [-1.5, 0., -0.25, 2.];
    for (i, &x) in global.iter().enumerate() {
        assert!((x - (initial[i] + expected[i])).abs() < 1e-6);
        assert!((local1[i] - x).abs() < 1e-6);
        assert!((local2[i] - x).abs() < 1e-6);
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_checkpoint_resyncs_other_workers() -> io::Result<()> {
    let ((mut wk1_rx, mut wk1_tx), (sv1_rx, sv1_tx)) = channel_pair();
    let ((mut wk2_rx, mut wk2_tx), (sv2_rx, sv2_tx)) = channel_pair();

    let checkpoint = CheckpointSpec {
        primary_rank: 1,
        period: 2,
        phase: 1,
        warmup: 0,
    };

    let mut server = create_server(3, checkpoint);
    server.spawn(sv1_rx, sv1_tx);
    server.spawn(sv2_rx, sv2_tx);

    let mut rx_buf = Vec::new();
    let mut local1 = VectorBuffer::zeros(PARAMS);
    let mut local2 = VectorBuffer::zeros(PARAMS);
    recv_into_model(&mut wk1_rx, &mut rx_buf, &mut local1).await?;
    recv_into_model(&mut wk2_rx, &mut rx_buf, &mut local2).await?;

    send_sparse(&mut wk2_tx, 2, 1, &[3], &[4.]).await?;
    let kind = recv_into_model(&mut wk2_rx, &mut rx_buf, &mut local2).await?;
    assert_eq!(kind, "SparseGradientUpdate");

    send_sparse(&mut wk1_tx, 1, 1, &[0], &[2.]).await?;
    let kind = recv_into_model(&mut wk1_rx, &mut rx_buf, &mut local1).await?;
    assert_eq!(kind, "SparseGradientUpdate");

    send_sparse(&mut wk2_tx, 2, 2, &[], &[]).await?;
    let kind = recv_into_model(&mut wk2_rx, &mut rx_buf, &mut local2).await?;
    assert_eq!(kind, "ModelUpdate");
    assert_eq!(*local2, [-2., 0., 0., -4.]);

    send_sparse(&mut wk2_tx, 2, 3, &[], &[]).await?;
    let kind = recv_into_model(&mut wk2_rx, &mut rx_buf, &mut local2).await?;
    assert_eq!(kind, "SparseGradientUpdate");

    disconnect(&mut wk1_rx, &mut wk1_tx).await?;
    disconnect(&mut wk2_rx, &mut wk2_tx).await?;

    let global = server.run().await;
    assert_eq!(*global, [-2., 0., 0., -4.]);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_bad_messages_are_dropped() -> io::Result<()> {
    let (stream1, stream2) = io::duplex(4096);
    let (wk_rx, mut wk_tx) = io::split(stream1);
    let (sv_rx, sv_tx) = io::split(stream2);

    let mut server = create_server(2, no_checkpoints());
    let (sv_rx, sv_tx) = comms::channel(sv_rx, sv_tx);
    server.spawn(sv_rx, sv_tx);

    let unknown_kind = [0, 0, 0, 0, 0, 0, 0, 4, 0, 0, 0, 9];
    wk_tx.write_all(&unknown_kind).await?;

    let (mut wk_rx, mut wk_tx) = comms::channel(wk_rx, wk_tx);

    let model = Msg::Data {
        sender: 1,
        version: 1,
        payload: Payload::Model(&[1.; PARAMS]),
    };
    wk_tx.send(&model).await?;

    let unknown_sender = Msg::Data {
        sender: 5,
        version: 1,
        payload: Payload::Gradient(&[1.; PARAMS]),
    };
    wk_tx.send(&unknown_sender).await?;

    let short = Msg::Data {
        sender: 1,
        version: 1,
        payload: Payload::Gradient(&[1.; PARAMS - 1]),
    };
    wk_tx.send(&short).await?;

    let grad = Msg::Data {
        sender: 1,
        version: 1,
        payload: Payload::Gradient(&[1.; PARAMS]),
    };
    wk_tx.send(&grad).await?;

    let mut rx_buf = Vec::new();
    let mut local = VectorBuffer::zeros(PARAMS);
    recv_into_model(&mut wk_rx, &mut rx_buf, &mut local).await?;
    assert_eq!(*local, [0.; PARAMS]);

    let kind = recv_into_model(&mut wk_rx, &mut rx_buf, &mut local).await?;
    assert_eq!(kind, "ModelUpdate");
    assert_eq!(*local, [-1.; PARAMS]);

    disconnect(&mut wk_rx, &mut wk_tx).await?;
    server.run().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_dead_worker_does_not_stall_others() -> io::Result<()> {
    let (dead, (sv1_rx, sv1_tx)) = channel_pair();
    let ((wk2_rx, wk2_tx), (sv2_rx, sv2_tx)) = channel_pair();

    let mut server = create_server(3, no_checkpoints());
    server.spawn(sv1_rx, sv1_tx);
    server.spawn(sv2_rx, sv2_tx);
    drop(dead);

    let barrier = Arc::new(Barrier::new(1));
    let local = mock_sparse_worker(wk2_rx, wk2_tx, 2, &[(1, 1.)], barrier).await?;
    assert_eq!(local, vec![0., -1., 0., 0.]);

    let global = server.run().await;
    assert_eq!(*global, [0., -1., 0., 0.]);
    Ok(())
}
