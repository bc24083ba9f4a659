//! Property-based tests for queue draining
//!
//! For any interleaving of enqueues, flushes and connectivity flips, every
//! entry is delivered at most once and in enqueue order per conversation.

use super::tests::fast_retry;
use super::*;
use crate::message::MessageRole;
use crate::persistence::MemoryStore;
use crate::testing::MockMessageApi;
use proptest::prelude::*;
use std::collections::HashMap;

#[derive(Debug, Clone)]
enum Op {
    Enqueue(usize),
    Flush,
    SetOnline(bool),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0usize..3).prop_map(Op::Enqueue),
        2 => Just(Op::Flush),
        1 => any::<bool>().prop_map(Op::SetOnline),
    ]
}

proptest! {
    #[test]
    fn drains_fifo_at_most_once(ops in prop::collection::vec(op_strategy(), 1..40)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .start_paused(true)
            .build()
            .unwrap();

        let api = Arc::new(MockMessageApi::new());
        let store = MessageStore::new(8);
        let queue = OfflineQueue::new(
            Arc::new(MemoryStore::new()),
            api.clone(),
            store.clone(),
            fast_retry(),
        )
        .unwrap();

        let mut enqueued: HashMap<String, Vec<String>> = HashMap::new();
        let mut counter = 0;

        runtime.block_on(async {
            for op in &ops {
                match op {
                    Op::Enqueue(conv) => {
                        counter += 1;
                        let conv = format!("c{conv}");
                        let content = format!("m{counter}");
                        let message = Message::optimistic(MessageRole::User, content.clone());
                        store.add_optimistic_message(&conv, message.clone()).unwrap();
                        queue.enqueue(&conv, message).unwrap();
                        enqueued.entry(conv).or_default().push(content);
                    }
                    Op::Flush => {
                        queue.flush().await.unwrap();
                    }
                    Op::SetOnline(online) => {
                        queue.set_online(*online);
                    }
                }
            }
            queue.set_online(true);
            queue.flush().await.unwrap();
        });

        let mut delivered: HashMap<String, Vec<String>> = HashMap::new();
        for (conv, message) in api.posted.lock().unwrap().iter() {
            delivered.entry(conv.clone()).or_default().push(message.content.clone());
        }

        prop_assert!(queue.is_empty());
        prop_assert_eq!(delivered, enqueued);
    }
}
