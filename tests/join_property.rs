//! Property-based tests for join completion
//!
//! However the N completions of a join are ordered or spread over threads,
//! exactly one continuation runs, once, and it sees every slot.

use proptest::prelude::*;
use s3gw::backend::BackendError;
use s3gw::core::join::{JoinOutcome, OpCompletion, OpStatus};
use s3gw::{EventLoop, GatewayConfig, ShutdownSignal};
use std::cell::{Cell, RefCell};
use std::rc::Rc;

#[derive(Default)]
struct Fired {
    success: Cell<u32>,
    failed: Cell<u32>,
    outcome: RefCell<Option<JoinOutcome>>,
}

fn launch_held(lp: &EventLoop, n: usize, fired: &Rc<Fired>) -> Vec<OpCompletion> {
    let mut held = Vec::with_capacity(n);
    let ok = fired.clone();
    let failed = fired.clone();
    lp.launch(
        "held join",
        n,
        |c| held.push(c),
        move |outcome| {
            ok.success.set(ok.success.get() + 1);
            *ok.outcome.borrow_mut() = Some(outcome);
        },
        move |outcome| {
            failed.failed.set(failed.failed.get() + 1);
            *failed.outcome.borrow_mut() = Some(outcome);
        },
    );
    held
}

fn result_for(success: bool) -> Result<Option<s3gw::core::join::Payload>, BackendError> {
    if success {
        Ok(None)
    } else {
        Err(BackendError::Failed {
            code: -5,
            message: "boom".into(),
        })
    }
}

fn scenario() -> impl Strategy<Value = (Vec<usize>, Vec<bool>)> {
    (1usize..20).prop_flat_map(|n| {
        (
            Just((0..n).collect::<Vec<usize>>()).prop_shuffle(),
            proptest::collection::vec(any::<bool>(), n),
        )
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_any_completion_order_fires_once((order, results) in scenario()) {
        let lp = EventLoop::new(&GatewayConfig::default(), ShutdownSignal::new());
        let fired = Rc::new(Fired::default());
        let mut held: Vec<Option<OpCompletion>> =
            launch_held(&lp, order.len(), &fired).into_iter().map(Some).collect();

        for &i in &order {
            if let Some(c) = held[i].take() {
                c.complete(result_for(results[i]));
            }
            prop_assert_eq!(fired.success.get() + fired.failed.get(), 0);
        }
        lp.run_until_idle().unwrap();
        lp.run_until_idle().unwrap();

        let any_ok = results.iter().any(|&r| r);
        prop_assert_eq!(fired.success.get(), u32::from(any_ok));
        prop_assert_eq!(fired.failed.get(), u32::from(!any_ok));

        let outcome = fired.outcome.borrow_mut().take().unwrap();
        prop_assert_eq!(outcome.len(), results.len());
        for (i, &ok) in results.iter().enumerate() {
            let expected = if ok { OpStatus::Success } else { OpStatus::Failed };
            prop_assert_eq!(outcome.slot(i).status, expected);
        }
    }

    #[test]
    fn prop_completions_from_threads_fire_once((order, results) in scenario()) {
        let lp = EventLoop::new(&GatewayConfig::default(), ShutdownSignal::new());
        let fired = Rc::new(Fired::default());
        let mut held: Vec<Option<OpCompletion>> =
            launch_held(&lp, order.len(), &fired).into_iter().map(Some).collect();

        std::thread::scope(|s| {
            for &i in &order {
                if let Some(c) = held[i].take() {
                    let ok = results[i];
                    s.spawn(move || c.complete(result_for(ok)));
                }
            }
        });
        lp.run_until_idle().unwrap();

        prop_assert_eq!(fired.success.get() + fired.failed.get(), 1);
        prop_assert_eq!(fired.outcome.borrow().as_ref().map(|o| o.len()), Some(results.len()));
    }

    #[test]
    fn prop_dropped_completions_count_as_cancelled(n in 1usize..20, keep in 0usize..20) {
        let lp = EventLoop::new(&GatewayConfig::default(), ShutdownSignal::new());
        let fired = Rc::new(Fired::default());
        let held = launch_held(&lp, n, &fired);

        for (i, c) in held.into_iter().enumerate() {
            if i < keep {
                c.complete(Ok(None));
            } else {
                drop(c);
            }
        }
        lp.run_until_idle().unwrap();

        let outcome = fired.outcome.borrow_mut().take().unwrap();
        prop_assert_eq!(fired.success.get(), u32::from(keep > 0));
        for i in keep.min(n)..n {
            prop_assert_eq!(outcome.error(i), Some(&BackendError::Cancelled));
        }
    }
}
