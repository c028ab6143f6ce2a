//! Cold `Flow` and its operator chain (see [`shared`] and [`state`] for
//! the hot variants).
//!
//! [`Flow::buffer`] — the one place a cold flow actually parks a fiber —
//! leans on `fiber::channel::Channel`'s suspension mechanics. The cold/hot
//! split mirrors the difference between a plain iterator and a shared
//! `ipc::Channel`: a `Flow`'s producer closure reruns from scratch on
//! every `collect`, exactly like calling a generator function again,
//! while [`SharedFlow`][shared::SharedFlow] and
//! [`StateFlow`][state::StateFlow] are long-lived broadcast state.
//!
//! Operators compose by wrapping the collector a producer emits into —
//! `map`/`filter` transform or drop values before forwarding, `take`
//! short-circuits the producer after `n` emissions, `catch` scopes error
//! handling to the producer side only, `buffer` decouples producer and
//! consumer timing through a bounded channel on a separate job. See
//! `flow::operators` for the concrete wrapper types.

mod operators;
pub mod shared;
pub mod state;

pub use shared::SharedFlow;
pub use state::StateFlow;

use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;

use operators::{
    DistinctCollector, DownstreamMarking, FilterCollector, FlatMapCollector, MapCollector,
    OnEachCollector, SkipCollector, TakeCollector,
};

use crate::channel::{Channel, TrySendError};
use crate::dispatch::Dispatcher;
use crate::error::{Error, Result};

pub(crate) type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + 'a>>;

/// How a value emitted into a hot flow's bounded buffer is handled once
/// the buffer is full (§4.I, §6, §7 `BufferOverflow`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackpressureStrategy {
    /// Parks the emitter until a slot frees. The default.
    Suspend,
    /// Evicts the oldest buffered value to make room for the new one.
    DropOldest,
    /// Drops the incoming value; the buffer is left unchanged.
    DropLatest,
    /// Fails the emit with `Error::BufferOverflow`.
    Error,
}

impl Default for BackpressureStrategy {
    fn default() -> Self {
        BackpressureStrategy::Suspend
    }
}

/// The suspend-capable sink a `Flow`'s producer emits values into. Boxed
/// and type-erased so operators can wrap one collector's transform around
/// another without `Flow<T>`'s operator methods needing to name every
/// wrapper type in their own signature.
pub(crate) trait Collector<T> {
    fn emit<'a>(&'a mut self, value: T) -> BoxFuture<'a, Result<()>>;
}

struct SyncCollector<F>(F);

impl<T, F> Collector<T> for SyncCollector<F>
where
    F: FnMut(T) -> Result<()>,
{
    fn emit<'a>(&'a mut self, value: T) -> BoxFuture<'a, Result<()>> {
        let result = (self.0)(value);
        Box::pin(async move { result })
    }
}

/// The handle a `Flow`'s producer closure emits values through. Wraps the
/// collector built for one particular `collect` call; a fresh `Emitter` is
/// constructed every time the producer runs, matching "construction
/// captures a producer function; each `collect` runs it afresh".
pub struct Emitter<T> {
    collector: Box<dyn Collector<T>>,
}

impl<T> Emitter<T> {
    /// Pushes `value` through the rest of the operator chain to the
    /// terminal consumer. Suspends only if a downstream `buffer()` stage
    /// is applying backpressure; otherwise resolves as soon as every
    /// downstream operator (and the consumer) has seen the value.
    pub async fn emit(&mut self, value: T) -> Result<()> {
        self.collector.emit(value).await
    }
}

type ProducerFn<T> = dyn Fn(Box<dyn Collector<T>>) -> BoxFuture<'static, Result<()>>;

/// A cold producer of values (§4.I). Cloning shares the same producer
/// closure; each clone still reruns it fresh on every `collect`.
pub struct Flow<T> {
    producer: Rc<ProducerFn<T>>,
}

impl<T> Clone for Flow<T> {
    fn clone(&self) -> Self {
        Self {
            producer: self.producer.clone(),
        }
    }
}

impl<T: 'static> Flow<T> {
    /// Builds a flow from a producer function. `f` is called fresh on
    /// every `collect`/operator-driven run; within it, `emitter.emit(v)`
    /// pushes `v` downstream.
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(Emitter<T>) -> Fut + 'static,
        Fut: Future<Output = Result<()>> + 'static,
    {
        let f = Rc::new(f);
        Flow {
            producer: Rc::new(move |collector: Box<dyn Collector<T>>| {
                let f = f.clone();
                let emitter = Emitter { collector };
                Box::pin(async move { (f)(emitter).await })
            }),
        }
    }

    pub(crate) fn run(&self, collector: Box<dyn Collector<T>>) -> BoxFuture<'static, Result<()>> {
        (self.producer)(collector)
    }

    /// Runs the producer to completion, invoking `consumer` with every
    /// value that survives the operator chain. Collection runs on the
    /// current fiber (no suspension of its own) unless a `buffer()` stage
    /// is present upstream.
    pub async fn collect<C>(&self, consumer: C) -> Result<()>
    where
        C: FnMut(T) -> Result<()> + 'static,
    {
        self.run(Box::new(SyncCollector(consumer))).await
    }

    /// Transforms each value with `f` before it reaches downstream
    /// operators or the consumer.
    pub fn map<U: 'static>(self, f: impl Fn(T) -> U + 'static) -> Flow<U> {
        let upstream = self;
        let f = Rc::new(f);
        Flow {
            producer: Rc::new(move |collector: Box<dyn Collector<U>>| {
                let upstream = upstream.clone();
                let f = f.clone();
                Box::pin(async move {
                    let wrapped: Box<dyn Collector<T>> = Box::new(MapCollector {
                        downstream: collector,
                        f,
                        _marker: std::marker::PhantomData,
                    });
                    upstream.run(wrapped).await
                })
            }),
        }
    }

    /// Drops values for which `predicate` returns `false`.
    pub fn filter(self, predicate: impl Fn(&T) -> bool + 'static) -> Flow<T> {
        let upstream = self;
        let predicate = Rc::new(predicate);
        Flow {
            producer: Rc::new(move |collector: Box<dyn Collector<T>>| {
                let upstream = upstream.clone();
                let predicate = predicate.clone();
                Box::pin(async move {
                    let wrapped: Box<dyn Collector<T>> = Box::new(FilterCollector {
                        downstream: collector,
                        predicate,
                    });
                    upstream.run(wrapped).await
                })
            }),
        }
    }

    /// Short-circuits the producer after the first `n` emissions reach
    /// this point in the chain. Values beyond `n` are never produced by
    /// the upstream side of this operator (it stops as soon as the
    /// producer's own `.emit(...).await?` unwinds), not merely dropped
    /// downstream of it.
    pub fn take(self, n: usize) -> Flow<T> {
        let upstream = self;
        Flow {
            producer: Rc::new(move |collector: Box<dyn Collector<T>>| {
                let upstream = upstream.clone();
                Box::pin(async move {
                    let stopped = Rc::new(std::cell::Cell::new(false));
                    let wrapped: Box<dyn Collector<T>> = Box::new(TakeCollector {
                        downstream: collector,
                        remaining: std::cell::Cell::new(n),
                        stopped: stopped.clone(),
                    });
                    match upstream.run(wrapped).await {
                        Ok(()) => Ok(()),
                        Err(Error::Cancelled) if stopped.get() => Ok(()),
                        Err(e) => Err(e),
                    }
                })
            }),
        }
    }

    /// Drops the first `n` values reaching this point in the chain,
    /// forwarding everything after unchanged.
    pub fn skip(self, n: usize) -> Flow<T> {
        let upstream = self;
        Flow {
            producer: Rc::new(move |collector: Box<dyn Collector<T>>| {
                let upstream = upstream.clone();
                Box::pin(async move {
                    let wrapped: Box<dyn Collector<T>> = Box::new(SkipCollector {
                        downstream: collector,
                        remaining: std::cell::Cell::new(n),
                    });
                    upstream.run(wrapped).await
                })
            }),
        }
    }

    /// Runs `f` as a side effect on every value reaching this point in the
    /// chain, then forwards the value unchanged.
    pub fn on_each(self, f: impl Fn(&T) + 'static) -> Flow<T> {
        let upstream = self;
        let f = Rc::new(f);
        Flow {
            producer: Rc::new(move |collector: Box<dyn Collector<T>>| {
                let upstream = upstream.clone();
                let f = f.clone();
                Box::pin(async move {
                    let wrapped: Box<dyn Collector<T>> = Box::new(OnEachCollector {
                        downstream: collector,
                        f,
                    });
                    upstream.run(wrapped).await
                })
            }),
        }
    }

    /// Maps each value to an inner `Flow`, collecting it fully (in
    /// emission order) before moving on to the next upstream value.
    pub fn flat_map<U: 'static, F, Fut>(self, f: F) -> Flow<U>
    where
        F: Fn(T) -> Fut + 'static,
        Fut: Future<Output = Flow<U>> + 'static,
    {
        let upstream = self;
        let f = Rc::new(f);
        Flow {
            producer: Rc::new(move |collector: Box<dyn Collector<U>>| {
                let upstream = upstream.clone();
                let f = f.clone();
                Box::pin(async move {
                    let wrapped: Box<dyn Collector<T>> = Box::new(FlatMapCollector {
                        downstream: Rc::new(std::cell::RefCell::new(collector)),
                        f,
                        _marker: std::marker::PhantomData,
                    });
                    upstream.run(wrapped).await
                })
            }),
        }
    }

    /// Runs the producer to completion, folding every emitted value into an
    /// accumulator with `f`, starting from `initial`. Returns the final
    /// accumulator.
    pub async fn reduce<A>(&self, initial: A, mut f: impl FnMut(A, T) -> A + 'static) -> Result<A>
    where
        A: 'static,
    {
        let acc = Rc::new(std::cell::RefCell::new(Some(initial)));
        let acc2 = acc.clone();
        self.collect(move |value| {
            let current = acc2.borrow_mut().take().expect("reduce accumulator always present between emits");
            *acc2.borrow_mut() = Some(f(current, value));
            Ok(())
        })
        .await?;
        Ok(acc.borrow_mut().take().expect("reduce accumulator present after collection"))
    }

    /// Handles an error raised by this flow's producer or an operator
    /// upstream of this point; an error raised downstream (a later
    /// operator, or the terminal consumer) passes through unhandled.
    pub fn catch(self, handler: impl Fn(Error) -> Result<()> + 'static) -> Flow<T> {
        let upstream = self;
        let handler = Rc::new(handler);
        Flow {
            producer: Rc::new(move |collector: Box<dyn Collector<T>>| {
                let upstream = upstream.clone();
                let handler = handler.clone();
                Box::pin(async move {
                    let marked = Rc::new(std::cell::Cell::new(false));
                    let wrapped: Box<dyn Collector<T>> = Box::new(DownstreamMarking {
                        inner: collector,
                        marked: marked.clone(),
                    });
                    match upstream.run(wrapped).await {
                        Ok(()) => Ok(()),
                        Err(e) if marked.get() => Err(e),
                        Err(e) => handler(e),
                    }
                })
            }),
        }
    }

    /// Runs `handler` exactly once after this flow's terminal event,
    /// passing the failure (if any) without swallowing it.
    pub fn on_completion(self, handler: impl Fn(Option<&Error>) + 'static) -> Flow<T> {
        let upstream = self;
        let handler = Rc::new(handler);
        Flow {
            producer: Rc::new(move |collector: Box<dyn Collector<T>>| {
                let upstream = upstream.clone();
                let handler = handler.clone();
                Box::pin(async move {
                    let result = upstream.run(collector).await;
                    match &result {
                        Ok(()) => handler(None),
                        Err(e) => handler(Some(e)),
                    }
                    result
                })
            }),
        }
    }

    /// Inserts a bounded channel between the producer and everything
    /// downstream, running the producer on its own job so producer and
    /// consumer timing decouple (§4.I). `strategy` governs what happens
    /// when the channel is full and the producer tries to emit again.
    pub fn buffer(self, capacity: usize, strategy: BackpressureStrategy) -> Flow<T> {
        let upstream = self;
        Flow {
            producer: Rc::new(move |collector: Box<dyn Collector<T>>| {
                let upstream = upstream.clone();
                Box::pin(async move {
                    let channel: Channel<T> = Channel::with_capacity(capacity.max(1));
                    let mut collector = collector;
                    let drain_channel = channel.clone();
                    let drain_job = crate::structured::launch(
                        async move {
                            loop {
                                match drain_channel.receive().await {
                                    Ok(value) => collector.emit(value).await?,
                                    Err(Error::ChannelClosed) => break,
                                    Err(e) => return Err(e),
                                }
                            }
                            Ok(())
                        },
                        Dispatcher::Default,
                    );

                    let emit_channel = channel.clone();
                    let produce_result = upstream
                        .run(Box::new(BufferedCollector {
                            channel: emit_channel,
                            strategy,
                        }))
                        .await;
                    channel.close();
                    let drain_result = drain_job.join().await;
                    produce_result.and(drain_result)
                })
            }),
        }
    }
}

impl<T: Clone + PartialEq + 'static> Flow<T> {
    /// Drops a value if it equals (by `PartialEq`) the last value that
    /// reached this point in the chain.
    pub fn distinct_until_changed(self) -> Flow<T> {
        let upstream = self;
        Flow {
            producer: Rc::new(move |collector: Box<dyn Collector<T>>| {
                let upstream = upstream.clone();
                Box::pin(async move {
                    let wrapped: Box<dyn Collector<T>> = Box::new(DistinctCollector {
                        downstream: collector,
                        last: std::cell::RefCell::new(None),
                    });
                    upstream.run(wrapped).await
                })
            }),
        }
    }
}

struct BufferedCollector<T> {
    channel: Channel<T>,
    strategy: BackpressureStrategy,
}

impl<T: 'static> Collector<T> for BufferedCollector<T> {
    fn emit<'a>(&'a mut self, value: T) -> BoxFuture<'a, Result<()>> {
        let channel = self.channel.clone();
        let strategy = self.strategy;
        Box::pin(async move {
            match strategy {
                BackpressureStrategy::Suspend => channel.send(value).await,
                BackpressureStrategy::DropOldest => {
                    if channel.is_full() {
                        let _ = channel.try_receive();
                    }
                    match channel.try_send(value) {
                        Ok(()) => Ok(()),
                        Err(TrySendError::Full(v)) => channel.send(v).await,
                        Err(TrySendError::Closed(_)) => Err(Error::ChannelClosed),
                    }
                }
                BackpressureStrategy::DropLatest => match channel.try_send(value) {
                    Ok(()) => Ok(()),
                    Err(TrySendError::Full(_)) => Ok(()),
                    Err(TrySendError::Closed(_)) => Err(Error::ChannelClosed),
                },
                BackpressureStrategy::Error => match channel.try_send(value) {
                    Ok(()) => Ok(()),
                    Err(TrySendError::Full(_)) => Err(Error::BufferOverflow),
                    Err(TrySendError::Closed(_)) => Err(Error::ChannelClosed),
                },
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structured::run_blocking;
    use std::cell::RefCell;

    #[test]
    fn collect_runs_the_producer_fresh_each_time() {
        let flow = Flow::new(|mut emitter| async move {
            emitter.emit(1).await?;
            emitter.emit(2).await?;
            emitter.emit(3).await?;
            Ok(())
        });

        let collect_twice = || {
            let values = Rc::new(RefCell::new(Vec::new()));
            let values2 = values.clone();
            run_blocking(
                {
                    let flow = flow.clone();
                    async move {
                        flow.collect(move |v| {
                            values2.borrow_mut().push(v);
                            Ok(())
                        })
                        .await
                    }
                },
                Default::default(),
            )
            .unwrap();
            values.borrow().clone()
        };

        assert_eq!(collect_twice(), vec![1, 2, 3]);
        assert_eq!(collect_twice(), vec![1, 2, 3]);
    }

    #[test]
    fn map_and_filter_compose_in_order() {
        let flow = Flow::new(|mut emitter| async move {
            for v in 1..=5 {
                emitter.emit(v).await?;
            }
            Ok(())
        })
        .filter(|v| v % 2 == 0)
        .map(|v| v * 10);

        let values = Rc::new(RefCell::new(Vec::new()));
        let values2 = values.clone();
        run_blocking(
            async move {
                flow.collect(move |v| {
                    values2.borrow_mut().push(v);
                    Ok(())
                })
                .await
            },
            Default::default(),
        )
        .unwrap();
        assert_eq!(*values.borrow(), vec![20, 40]);
    }

    #[test]
    fn take_stops_the_producer_after_n_and_completes_cleanly() {
        let ran_past_two = Rc::new(RefCell::new(false));
        let ran_past_two2 = ran_past_two.clone();
        let flow = Flow::new(move |mut emitter| {
            let ran_past_two = ran_past_two2.clone();
            async move {
                for v in 1..=10 {
                    emitter.emit(v).await?;
                    if v > 2 {
                        *ran_past_two.borrow_mut() = true;
                    }
                }
                Ok(())
            }
        })
        .take(2);

        let values = Rc::new(RefCell::new(Vec::new()));
        let values2 = values.clone();
        let result = run_blocking(
            async move {
                flow.collect(move |v| {
                    values2.borrow_mut().push(v);
                    Ok(())
                })
                .await
            },
            Default::default(),
        );
        assert!(result.is_ok());
        assert_eq!(*values.borrow(), vec![1, 2]);
        assert!(!*ran_past_two.borrow());
    }

    #[test]
    fn catch_handles_only_upstream_errors() {
        let flow = Flow::new(|mut emitter| async move {
            emitter.emit(1).await?;
            Err(Error::InvalidState("producer failed".into()))
        })
        .catch(|_err| Ok(()));

        let result = run_blocking(
            async move { flow.collect(|_| Ok(())).await },
            Default::default(),
        );
        assert!(result.is_ok());

        let flow_with_failing_consumer = Flow::new(|mut emitter| async move {
            emitter.emit(1).await?;
            Ok(())
        })
        .catch(|_err| Ok(()));

        let result = run_blocking(
            async move {
                flow_with_failing_consumer
                    .collect(|_| Err(Error::InvalidArgument("nope".into())))
                    .await
            },
            Default::default(),
        );
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn on_completion_runs_once_and_does_not_swallow_errors() {
        let completions = Rc::new(RefCell::new(0));
        let completions2 = completions.clone();
        let flow = Flow::new(|mut emitter| async move {
            emitter.emit(1).await?;
            Ok(())
        })
        .on_completion(move |_err| {
            *completions2.borrow_mut() += 1;
        });

        run_blocking(
            async move { flow.collect(|_| Ok(())).await },
            Default::default(),
        )
        .unwrap();
        assert_eq!(*completions.borrow(), 1);
    }

    #[test]
    fn buffer_decouples_producer_and_consumer() {
        let values = Rc::new(RefCell::new(Vec::new()));
        let values2 = values.clone();
        let flow = Flow::new(|mut emitter| async move {
            for v in 1..=4 {
                emitter.emit(v).await?;
            }
            Ok(())
        })
        .buffer(2, BackpressureStrategy::Suspend);

        run_blocking(
            async move {
                flow.collect(move |v| {
                    values2.borrow_mut().push(v);
                    Ok(())
                })
                .await
            },
            Default::default(),
        )
        .unwrap();
        assert_eq!(*values.borrow(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn distinct_until_changed_drops_repeats() {
        let flow = Flow::new(|mut emitter| async move {
            for v in [1, 1, 2, 2, 2, 3, 1] {
                emitter.emit(v).await?;
            }
            Ok(())
        })
        .distinct_until_changed();

        let values = Rc::new(RefCell::new(Vec::new()));
        let values2 = values.clone();
        run_blocking(
            async move {
                flow.collect(move |v| {
                    values2.borrow_mut().push(v);
                    Ok(())
                })
                .await
            },
            Default::default(),
        )
        .unwrap();
        assert_eq!(*values.borrow(), vec![1, 2, 3, 1]);
    }

    #[test]
    fn skip_drops_the_first_n_values() {
        let flow = Flow::new(|mut emitter| async move {
            for v in 1..=5 {
                emitter.emit(v).await?;
            }
            Ok(())
        })
        .skip(2);

        let values = Rc::new(RefCell::new(Vec::new()));
        let values2 = values.clone();
        run_blocking(
            async move {
                flow.collect(move |v| {
                    values2.borrow_mut().push(v);
                    Ok(())
                })
                .await
            },
            Default::default(),
        )
        .unwrap();
        assert_eq!(*values.borrow(), vec![3, 4, 5]);
    }

    #[test]
    fn on_each_runs_as_a_side_effect_without_changing_values() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let seen2 = seen.clone();
        let flow = Flow::new(|mut emitter| async move {
            for v in 1..=3 {
                emitter.emit(v).await?;
            }
            Ok(())
        })
        .on_each(move |v| seen2.borrow_mut().push(*v));

        let values = Rc::new(RefCell::new(Vec::new()));
        let values2 = values.clone();
        run_blocking(
            async move {
                flow.collect(move |v| {
                    values2.borrow_mut().push(v);
                    Ok(())
                })
                .await
            },
            Default::default(),
        )
        .unwrap();
        assert_eq!(*seen.borrow(), vec![1, 2, 3]);
        assert_eq!(*values.borrow(), vec![1, 2, 3]);
    }

    #[test]
    fn flat_map_expands_each_value_into_an_inner_flow() {
        let flow = Flow::new(|mut emitter| async move {
            for v in 1..=3 {
                emitter.emit(v).await?;
            }
            Ok(())
        })
        .flat_map(|v| async move {
            Flow::new(move |mut emitter| async move {
                emitter.emit(v).await?;
                emitter.emit(v * 10).await?;
                Ok(())
            })
        });

        let values = Rc::new(RefCell::new(Vec::new()));
        let values2 = values.clone();
        run_blocking(
            async move {
                flow.collect(move |v| {
                    values2.borrow_mut().push(v);
                    Ok(())
                })
                .await
            },
            Default::default(),
        )
        .unwrap();
        assert_eq!(*values.borrow(), vec![1, 10, 2, 20, 3, 30]);
    }

    #[test]
    fn reduce_folds_emitted_values_into_an_accumulator() {
        let flow = Flow::new(|mut emitter| async move {
            for v in 1..=4 {
                emitter.emit(v).await?;
            }
            Ok(())
        });

        let sum = run_blocking(
            async move { flow.reduce(0, |acc, v| acc + v).await },
            Default::default(),
        )
        .unwrap();
        assert_eq!(sum, 10);
    }
}
