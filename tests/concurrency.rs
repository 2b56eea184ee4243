use std::sync::Arc;
use std::thread;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use anvil_interpreter::{
    Channel, Elemwise, ElemwiseMode, HostTensor, Interpreter, InterpreterConfig, TensorState,
};

const THREADS: usize = 8;
const APPLIES_PER_THREAD: usize = 125;

fn worker_channel() -> Arc<dyn Channel> {
    Interpreter::with_reference_kernel(InterpreterConfig::default())
        .unwrap()
        .create_channel()
        .unwrap()
}

#[test]
fn test_many_threads_submit_concurrently() {
    let channel = worker_channel();

    let workers: Vec<_> = (0..THREADS)
        .map(|t| {
            let channel = channel.clone();
            thread::spawn(move || {
                let mut rng = StdRng::seed_from_u64(t as u64);
                let mut expected = 0.0f32;
                let mut current = channel
                    .put(HostTensor::from_f32([4], vec![0.0; 4]).unwrap(), true)
                    .unwrap();
                let mut handles = vec![current];
                for _ in 0..APPLIES_PER_THREAD {
                    let step = rng.gen_range(1..=4) as f32;
                    expected += step;
                    let op = Arc::new(Elemwise::new(ElemwiseMode::AddScalar(step)));
                    current = channel.apply_op(op, &[current]).unwrap()[0];
                    handles.push(current);
                }
                (current, expected, handles)
            })
        })
        .collect();

    let results: Vec<_> = workers.into_iter().map(|w| w.join().unwrap()).collect();
    channel.sync().unwrap();

    let stats = channel.stats();
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.ready, THREADS * (APPLIES_PER_THREAD + 1));
    assert_eq!(stats.processed, stats.submitted);

    for (last, expected, handles) in results {
        assert_eq!(channel.get_value(last).unwrap().to_vec_f32().unwrap(), vec![expected; 4]);
        for handle in handles {
            assert_eq!(channel.state(handle).unwrap(), TensorState::Ready);
        }
    }
}

#[test]
fn test_handles_cross_threads() {
    let channel = worker_channel();
    let x = channel
        .put(HostTensor::from_f32([2], vec![1.0, -1.0]).unwrap(), false)
        .unwrap();

    let producer = {
        let channel = channel.clone();
        thread::spawn(move || {
            channel
                .apply_op(Arc::new(Elemwise::new(ElemwiseMode::Neg)), &[x])
                .unwrap()[0]
        })
    };
    let y = producer.join().unwrap();

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let channel = channel.clone();
            thread::spawn(move || channel.get_value(y).unwrap().to_vec_f32().unwrap())
        })
        .collect();
    for reader in readers {
        assert_eq!(reader.join().unwrap(), vec![-1.0, 1.0]);
    }
}

#[test]
fn test_concurrent_deletes_leave_nothing_behind() {
    let channel = worker_channel();

    let workers: Vec<_> = (0..THREADS)
        .map(|_| {
            let channel = channel.clone();
            thread::spawn(move || {
                for i in 0..50 {
                    let x = channel
                        .put(HostTensor::from_f32([1], vec![i as f32]).unwrap(), true)
                        .unwrap();
                    let y = channel
                        .apply_op(Arc::new(Elemwise::new(ElemwiseMode::Relu)), &[x])
                        .unwrap()[0];
                    channel.del(x).unwrap();
                    channel.del(y).unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    channel.sync().unwrap();
    let stats = channel.stats();
    assert_eq!(stats.live(), 0);
    assert_eq!(stats.retained, 0);
    assert_eq!(stats.bytes_in_use, 0);
}
