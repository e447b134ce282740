/*!
Equality-gated reactive cells, keyed stores, cached derivations, and a tear-free bridge
for pull-based renderers.

# Design requirements:
- Writers and readers are different types; a `Read` can observe but never set.
- `set` notifies synchronously, in registration order, and only when the equality gate says the value changed.
- A panicking listener never stops delivery to the listeners after it.
- A derivation of the same (source, projection) pair is shared, so N consumers cost one upstream subscription.
- The bridge never hands a renderer a snapshot that is newer than the last change it announced.

# Basic usage

```rust
use tearless_signals::*;

let signal = Mut::new(42);
let _guard = signal.read().subscribe(|value: i32| println!("Read value: {}", value));
signal.set(43); // prints "Read value: 43"
signal.set(43); // gated, prints nothing
```

# Derivations

```rust
use tearless_signals::*;

let cache = DeriveCache::new(CacheConfig::default());
let count = Mut::new(2);
let double = projection(|value: &i32| value * 2);

let a = cache.get_or_create(&count.read(), &double);
let b = cache.get_or_create(&count.read(), &double);
assert!(a.ptr_eq(&b));

let _guard = a.subscribe(|value: i32| println!("doubled: {value}"));
count.set(5); // prints "doubled: 10"
assert_eq!(count.subscriber_count(), 1);
```

# Bridging to a pull-based renderer

```rust
use tearless_signals::*;

let counter = Mut::new(0);
let store = ExternalStore::new(counter.read(), 0);
let unsubscribe = store.subscribe(|| println!("re-render"));

counter.set(1);
assert_eq!(store.get_snapshot(), 1);
unsubscribe.unsubscribe();
```
*/

mod broadcast;
mod bridge;
mod cache;
mod derived;
mod equality;
mod error;
mod lock;
mod porcelain;
mod signal;
mod store;
mod value;

pub use broadcast::{Broadcast, BroadcastId, BroadcastListener, IntoBroadcastListener};
pub use bridge::*;
pub use cache::*;
pub use derived::*;
pub use equality::*;
pub use error::*;
pub use porcelain::*;
pub use signal::*;
pub use store::*;
