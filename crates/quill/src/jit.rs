use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};

use quill_core::{
    Array, ArrayId, BinaryOp, CmpOp, DType, Device, Error, Index, Op, ReduceOp, Result, Shape,
    UnaryOp,
};

// compile — trace once per signature, replay a flat plan afterwards
//
// `compile(f)` wraps a function of arrays plus static arguments. Each
// call computes a Signature from the argument shapes/dtypes and the
// static values. On a miss the function is traced once over placeholder
// arrays; the recorded graph is flattened into a Plan, a tape of steps
// with pre-resolved value slots, and cached. On a hit the plan replays
// directly with no retrace.
//
// Build discipline is single-flight: the first caller for a signature
// marks it Building and traces outside the lock; concurrent callers for
// the same signature wait on a condvar and receive the builder's plan.
// A failed build is cached too and reported to every caller of that
// signature, never silently retried.

/// A non-array argument that participates in the cache signature.
/// Changing its value is a guaranteed compile miss.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StaticArg {
    Int(i64),
    Bool(bool),
}

/// Cache key: array shapes and dtypes plus static argument values.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Signature {
    arrays: Vec<(Vec<usize>, DType)>,
    statics: Vec<StaticArg>,
}

impl Signature {
    fn of(inputs: &[Array], statics: &[StaticArg]) -> Signature {
        Signature {
            arrays: inputs
                .iter()
                .map(|a| (a.dims().to_vec(), a.dtype()))
                .collect(),
            statics: statics.to_vec(),
        }
    }
}

/// Counters exposed for observing cache behavior.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompileStats {
    /// Plans built (successful traces).
    pub builds: u64,
    /// Calls served by an existing entry: a cached plan, a cached
    /// failure, or a plan another caller finished building first.
    pub hits: u64,
    /// Calls that found no entry and initiated a build.
    pub misses: u64,
}

/// One step of a plan: an operation over value slots. Slot indices are
/// resolved at build time; execution is a single pass over the tape.
#[derive(Debug, Clone)]
enum Step {
    Binary(BinaryOp, usize, usize),
    Unary(UnaryOp, usize),
    Powf(usize, f64),
    Affine(usize, f64, f64),
    Reduce(ReduceOp, usize, Vec<usize>, bool),
    Matmul(usize, usize),
    Reshape(usize, Shape),
    Transpose(usize, usize, usize),
    Narrow(usize, usize, usize, usize),
    Broadcast(usize, Shape),
    Stack(Vec<usize>, usize),
    Update {
        input: usize,
        values: usize,
        index: Index,
    },
    WhereCond(usize, usize, usize),
    Cast(usize, DType),
    Cmp(CmpOp, usize, usize),
    Transfer(usize, Device),
}

/// A compiled execution plan: constants preloaded into slots, inputs
/// bound per call, steps writing one slot each.
#[derive(Debug)]
struct Plan {
    /// (slot, value) pairs for captured constant arrays.
    consts: Vec<(usize, Array)>,
    /// Slot for each array argument, by position.
    input_slots: Vec<usize>,
    /// (slot, step) pairs in execution order.
    steps: Vec<(usize, Step)>,
    output_slot: usize,
    slot_count: usize,
}

impl Plan {
    fn execute(&self, inputs: &[Array]) -> Result<Array> {
        let mut slots: Vec<Option<Array>> = vec![None; self.slot_count];
        for (slot, value) in &self.consts {
            slots[*slot] = Some(value.clone());
        }
        for (pos, slot) in self.input_slots.iter().enumerate() {
            slots[*slot] = Some(inputs[pos].clone());
        }
        for (slot, step) in &self.steps {
            let value = step.run(&slots)?;
            slots[*slot] = Some(value);
        }
        match slots[self.output_slot].take() {
            Some(out) => Ok(out),
            None => Err(Error::msg("plan output slot was never written")),
        }
    }
}

impl Step {
    fn run(&self, slots: &[Option<Array>]) -> Result<Array> {
        let get = |slot: usize| -> Result<&Array> {
            slots[slot]
                .as_ref()
                .ok_or_else(|| Error::msg(format!("plan slot {slot} read before write")))
        };
        match self {
            Step::Binary(op, a, b) => {
                let (a, b) = (get(*a)?, get(*b)?);
                match op {
                    BinaryOp::Add => a.add(b),
                    BinaryOp::Sub => a.sub(b),
                    BinaryOp::Mul => a.mul(b),
                    BinaryOp::Div => a.div(b),
                }
            }
            Step::Unary(op, a) => {
                let a = get(*a)?;
                match op {
                    UnaryOp::Neg => a.neg(),
                    UnaryOp::Abs => a.abs(),
                    UnaryOp::Exp => a.exp(),
                    UnaryOp::Log => a.log(),
                    UnaryOp::Sqrt => a.sqrt(),
                    UnaryOp::Square => a.square(),
                    UnaryOp::Sin => a.sin(),
                    UnaryOp::Cos => a.cos(),
                    UnaryOp::Tanh => a.tanh(),
                }
            }
            Step::Powf(a, e) => get(*a)?.powf(*e),
            Step::Affine(a, mul, add) => get(*a)?.affine(*mul, *add),
            Step::Reduce(op, a, dims, keep_dim) => {
                let a = get(*a)?;
                match op {
                    ReduceOp::Sum => a.sum(dims, *keep_dim),
                    ReduceOp::Mean => a.mean(dims, *keep_dim),
                    ReduceOp::Max => a.max(dims, *keep_dim),
                    ReduceOp::Min => a.min(dims, *keep_dim),
                }
            }
            Step::Matmul(a, b) => get(*a)?.matmul(get(*b)?),
            Step::Reshape(a, shape) => get(*a)?.reshape(shape.clone()),
            Step::Transpose(a, d0, d1) => get(*a)?.transpose(*d0, *d1),
            Step::Narrow(a, dim, start, len) => get(*a)?.narrow(*dim, *start, *len),
            Step::Broadcast(a, shape) => get(*a)?.broadcast_to(shape.clone()),
            Step::Stack(inputs, axis) => {
                let arrays: Vec<Array> = inputs
                    .iter()
                    .map(|&s| get(s).cloned())
                    .collect::<Result<_>>()?;
                Array::stack(&arrays, *axis)
            }
            Step::Update {
                input,
                values,
                index,
            } => get(*input)?.update(index, get(*values)?),
            Step::WhereCond(mask, t, f) => get(*mask)?.where_cond(get(*t)?, get(*f)?),
            Step::Cast(a, dtype) => get(*a)?.cast(*dtype),
            Step::Cmp(op, a, b) => {
                let (a, b) = (get(*a)?, get(*b)?);
                match op {
                    CmpOp::Eq => a.eq(b),
                    CmpOp::Ne => a.ne(b),
                    CmpOp::Lt => a.lt(b),
                    CmpOp::Le => a.le(b),
                    CmpOp::Gt => a.gt(b),
                    CmpOp::Ge => a.ge(b),
                }
            }
            Step::Transfer(a, device) => get(*a)?.place(*device),
        }
    }
}

fn topo_sort(root: &Array) -> Vec<Array> {
    fn walk(node: &Array, seen: &mut std::collections::HashSet<ArrayId>, out: &mut Vec<Array>) {
        if !seen.insert(node.id()) {
            return;
        }
        for input in node.op().inputs() {
            walk(input, seen, out);
        }
        out.push(node.clone());
    }
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    walk(root, &mut seen, &mut out);
    out
}

fn build_plan<F>(f: &F, inputs: &[Array], statics: &[StaticArg]) -> Result<Plan>
where
    F: Fn(&[Array], &[StaticArg]) -> Result<Array>,
{
    // Abstract trace: run f over placeholders carrying only the shapes
    // and dtypes of the concrete arguments.
    let placeholders: Vec<Array> = inputs
        .iter()
        .enumerate()
        .map(|(i, a)| Array::placeholder_for_arg(a.shape().clone(), a.dtype(), i))
        .collect();
    let output = f(&placeholders, statics).map_err(|e| match e {
        Error::UnsupportedTraceControlFlow { context } => Error::UnsupportedTraceControlFlow {
            context: format!(
                "{context}; values that control flow must be passed as static \
                 arguments so they become part of the compilation signature"
            ),
        },
        other => other,
    })?;

    let nodes = topo_sort(&output);
    let mut slot_of: HashMap<ArrayId, usize> = HashMap::new();
    let mut consts = Vec::new();
    let mut steps = Vec::new();
    for node in &nodes {
        let slot = slot_of.len();
        slot_of.insert(node.id(), slot);
        match node.op() {
            Op::None => {
                // Placeholder leaves bind to call inputs below; any other
                // leaf is an array captured by the function body.
                if !node.is_traced() {
                    consts.push((slot, node.clone()));
                }
            }
            op => {
                let s = |a: &Array| slot_of[&a.id()];
                let step = match op {
                    Op::None => unreachable!("leaf handled above"),
                    Op::Binary(bop, a, b) => Step::Binary(*bop, s(a), s(b)),
                    Op::Unary(uop, a) => Step::Unary(*uop, s(a)),
                    Op::Powf(a, e) => Step::Powf(s(a), *e),
                    Op::Affine(a, mul, add) => Step::Affine(s(a), *mul, *add),
                    Op::Reduce(rop, a, dims, keep_dim) => {
                        Step::Reduce(*rop, s(a), dims.clone(), *keep_dim)
                    }
                    Op::Matmul(a, b) => Step::Matmul(s(a), s(b)),
                    Op::Reshape(a) => Step::Reshape(s(a), node.shape().clone()),
                    Op::Transpose(a, d0, d1) => Step::Transpose(s(a), *d0, *d1),
                    Op::Narrow {
                        input,
                        dim,
                        start,
                        len,
                    } => Step::Narrow(s(input), *dim, *start, *len),
                    Op::Broadcast(a) => Step::Broadcast(s(a), node.shape().clone()),
                    Op::Stack(arrays, axis) => {
                        Step::Stack(arrays.iter().map(&s).collect(), *axis)
                    }
                    Op::Update {
                        input,
                        values,
                        index,
                    } => Step::Update {
                        input: s(input),
                        values: s(values),
                        index: index.clone(),
                    },
                    Op::WhereCond {
                        mask,
                        on_true,
                        on_false,
                    } => Step::WhereCond(s(mask), s(on_true), s(on_false)),
                    Op::Cast(a) => Step::Cast(s(a), node.dtype()),
                    Op::Cmp(cop, a, b) => Step::Cmp(*cop, s(a), s(b)),
                    Op::Transfer(a) => Step::Transfer(s(a), node.device()),
                };
                steps.push((slot, step));
            }
        }
    }

    // Bind argument positions, allocating fresh slots for arguments the
    // output never uses.
    let mut slot_count = slot_of.len();
    let input_slots: Vec<usize> = placeholders
        .iter()
        .map(|p| {
            slot_of.get(&p.id()).copied().unwrap_or_else(|| {
                let slot = slot_count;
                slot_count += 1;
                slot
            })
        })
        .collect();

    Ok(Plan {
        consts,
        input_slots,
        steps,
        output_slot: slot_of[&output.id()],
        slot_count,
    })
}

enum Entry {
    Building,
    Ready(Arc<Plan>),
    Failed(String),
}

struct State {
    plans: HashMap<Signature, Entry>,
    stats: CompileStats,
}

/// A compiled function: a plan cache keyed by argument signature.
pub struct Compiled<F> {
    f: F,
    state: Mutex<State>,
    built: Condvar,
}

/// Wrap a function of arrays and static arguments in a compilation
/// cache. See the module docs for signature and single-flight rules.
pub fn compile<F>(f: F) -> Compiled<F>
where
    F: Fn(&[Array], &[StaticArg]) -> Result<Array>,
{
    Compiled {
        f,
        state: Mutex::new(State {
            plans: HashMap::new(),
            stats: CompileStats::default(),
        }),
        built: Condvar::new(),
    }
}

impl<F> Compiled<F>
where
    F: Fn(&[Array], &[StaticArg]) -> Result<Array>,
{
    /// Execute on concrete arguments, building the plan for this
    /// signature first if no cached one exists.
    pub fn call(&self, inputs: &[Array], statics: &[StaticArg]) -> Result<Array> {
        let plan = self.plan_for(inputs, statics)?;
        plan.execute(inputs)
    }

    /// Current cache counters.
    pub fn stats(&self) -> CompileStats {
        self.state.lock().expect("plan cache lock poisoned").stats
    }

    fn plan_for(&self, inputs: &[Array], statics: &[StaticArg]) -> Result<Arc<Plan>> {
        let signature = Signature::of(inputs, statics);
        let mut state = self.state.lock().expect("plan cache lock poisoned");
        loop {
            match state.plans.get(&signature) {
                Some(Entry::Ready(plan)) => {
                    let plan = plan.clone();
                    state.stats.hits += 1;
                    return Ok(plan);
                }
                Some(Entry::Failed(msg)) => {
                    // Failures are cached: every caller of this signature
                    // sees the original build error, no silent retry.
                    let msg = msg.clone();
                    state.stats.hits += 1;
                    return Err(Error::msg(msg));
                }
                Some(Entry::Building) => {
                    state = self
                        .built
                        .wait(state)
                        .expect("plan cache lock poisoned");
                }
                None => {
                    state.stats.misses += 1;
                    state
                        .plans
                        .insert(signature.clone(), Entry::Building);
                    break;
                }
            }
        }
        drop(state);

        // Trace outside the lock; other signatures stay callable.
        let built = build_plan(&self.f, inputs, statics);
        let mut state = self.state.lock().expect("plan cache lock poisoned");
        let result = match built {
            Ok(plan) => {
                let plan = Arc::new(plan);
                state.stats.builds += 1;
                state
                    .plans
                    .insert(signature, Entry::Ready(plan.clone()));
                Ok(plan)
            }
            Err(e) => {
                state
                    .plans
                    .insert(signature, Entry::Failed(e.to_string()));
                Err(e)
            }
        };
        self.built.notify_all();
        result
    }
}
