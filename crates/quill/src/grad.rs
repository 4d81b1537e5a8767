use quill_core::{backward, bail, Array, Result};

// gradient / value_and_gradient — the functional differentiation API
//
// Both take a scalar-valued function of arrays and return a closure.
// Calling the closure runs `f` once (recording the trace as a side
// effect of the eager ops), seeds reverse-mode accumulation at the
// scalar output, and reads the requested inputs' gradients out of the
// store. The trace lives only for the duration of the call.
//
// Because every backward rule is itself made of recorded ops, wrapping
// `gradient` around a gradient closure differentiates the recorded
// backward expressions: higher-order derivatives come for free.

fn run<F>(f: &F, argnums: &[usize], inputs: &[Array]) -> Result<(Array, Vec<Array>)>
where
    F: Fn(&[Array]) -> Result<Array>,
{
    for &i in argnums {
        if i >= inputs.len() {
            bail!(
                "gradient argument index {} out of range for {} inputs",
                i,
                inputs.len()
            );
        }
    }
    let output = f(inputs)?;
    let store = backward(&output)?;
    let grads = argnums
        .iter()
        .map(|&i| {
            // Read, don't drain: the same array may be requested at more
            // than one argument position. No gradient flowing to an input
            // means it does not influence the output: its gradient is zero.
            store
                .get(inputs[i].id())
                .cloned()
                .unwrap_or_else(|| inputs[i].zeros_like())
        })
        .collect();
    Ok((output, grads))
}

/// Gradient of a scalar-valued function with respect to the inputs at
/// the given argument positions.
///
/// ```
/// use quill::prelude::*;
///
/// let square = |xs: &[Array]| xs[0].square()?.sum_all();
/// let d = gradient(square, &[0]);
/// let x = Array::full((), 3.0, DType::F64);
/// let grads = d(&[x]).unwrap();
/// assert_eq!(grads[0].to_scalar().unwrap(), 6.0);
/// ```
pub fn gradient<F>(f: F, argnums: &[usize]) -> impl Fn(&[Array]) -> Result<Vec<Array>>
where
    F: Fn(&[Array]) -> Result<Array>,
{
    let argnums = argnums.to_vec();
    move |inputs: &[Array]| run(&f, &argnums, inputs).map(|(_, grads)| grads)
}

/// Like [`gradient`] but also returns the function value, from the same
/// single trace pass.
pub fn value_and_gradient<F>(
    f: F,
    argnums: &[usize],
) -> impl Fn(&[Array]) -> Result<(Array, Vec<Array>)>
where
    F: Fn(&[Array]) -> Result<Array>,
{
    let argnums = argnums.to_vec();
    move |inputs: &[Array]| run(&f, &argnums, inputs)
}
