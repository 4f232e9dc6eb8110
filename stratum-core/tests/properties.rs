//! Property Tests
//!
//! Random acyclic graphs of sums over three signals, checked against a
//! from-scratch reference after every batch of writes.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use proptest::prelude::*;
use proptest::sample::Index;
use stratum_core::{Memo, Result, Runtime, Signal};

const SIGNALS: usize = 3;

enum Node {
    Input(Signal<i64>),
    Derived(Memo<i64>),
}

impl Node {
    fn get(&self) -> Result<i64> {
        match self {
            Node::Input(signal) => Ok(signal.get()),
            Node::Derived(memo) => memo.get(),
        }
    }
}

/// Memo `i` reads the two nodes picked by `wiring[i]` out of everything
/// created before it.
fn inputs(wiring: &[(Index, Index)], i: usize) -> (usize, usize) {
    let (left, right) = &wiring[i];
    (left.index(SIGNALS + i), right.index(SIGNALS + i))
}

fn reference(wiring: &[(Index, Index)], signals: &[i64]) -> Vec<i64> {
    let mut values = signals.to_vec();
    for i in 0..wiring.len() {
        let (left, right) = inputs(wiring, i);
        values.push(values[left] + values[right] + i as i64);
    }
    values
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn drains_are_glitch_free(
        wiring in prop::collection::vec((any::<Index>(), any::<Index>()), 1..10),
        writes in prop::collection::vec((0..SIGNALS, -50_i64..50), 1..20),
    ) {
        let rt = Runtime::new();
        let mirror = Rc::new(RefCell::new(vec![0_i64; SIGNALS]));
        let glitches = Rc::new(Cell::new(0_u32));
        let runs: Vec<Rc<Cell<u32>>> = wiring.iter().map(|_| Rc::default()).collect();
        let wiring = Rc::new(wiring);

        let mut nodes: Vec<Rc<Node>> = (0..SIGNALS)
            .map(|_| Rc::new(Node::Input(rt.signal(0))))
            .collect();
        for i in 0..wiring.len() {
            let (left, right) = inputs(&wiring, i);
            let (left, right) = (nodes[left].clone(), nodes[right].clone());
            let (wiring, mirror, glitches, runs) =
                (wiring.clone(), mirror.clone(), glitches.clone(), runs[i].clone());
            let memo = rt.memo(move |_| {
                runs.set(runs.get() + 1);
                let value = left.get()? + right.get()? + i as i64;
                if value != reference(&wiring, &mirror.borrow())[SIGNALS + i] {
                    glitches.set(glitches.get() + 1);
                }
                Ok(value)
            });
            nodes.push(Rc::new(Node::Derived(memo)));
        }

        for batch in writes.chunks(3) {
            for &(signal, value) in batch {
                mirror.borrow_mut()[signal] = value;
                if let Node::Input(input) = &*nodes[signal] {
                    input.set(value);
                }
            }
            runs.iter().for_each(|count| count.set(0));
            rt.stabilize();

            prop_assert_eq!(rt.scheduled_count(), 0);
            for (i, count) in runs.iter().enumerate() {
                prop_assert!(count.get() <= 1, "memo {} ran {} times", i, count.get());
            }
            let expected = reference(&wiring, &mirror.borrow());
            for (node, want) in nodes.iter().zip(&expected) {
                prop_assert_eq!(node.get().unwrap(), *want);
            }
        }
        prop_assert_eq!(glitches.get(), 0);
    }
}
