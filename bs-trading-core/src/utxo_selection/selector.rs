//! Deterministic best-set coin selector
//!
//! The selector is a pure function of its inputs. It never looks at the clock,
//! never randomizes, and bounds its search by a node count rather than a
//! timeout, so the same snapshot always yields the same subset.
//!
//! # Policy
//!
//! 1. Candidates are put into [`selection_order`](super::utils::selection_order).
//! 2. With `exact_match`, subsets of increasing size are searched for one whose
//!    value equals target plus fee. The first hit at the smallest size wins, so
//!    a single matching UTXO beats a matching pair.
//! 3. Otherwise the smallest input count able to cover target plus fee is
//!    found by ranking candidates on effective value (amount minus the fee of
//!    spending them), and among subsets of that size the one with the least
//!    excess is picked. Fewer inputs always wins over a smaller excess.
//! 4. Change below [`change_threshold`](super::utils::change_threshold) is
//!    folded into the fee.
//! 5. Results above the configured virtual size are flagged, not rejected.

use bitcoin::Amount;
use log::{debug, warn};

use crate::config::SelectionConfig;
use crate::error::SelectionError;
use crate::fee_estimation::{FeeSpec, TX_OVERHEAD_VSIZE};
use crate::types::AddressType;
use crate::utxo_selection::types::{SelectionRequest, SelectionResult, Utxo};
use crate::utxo_selection::utils;

/// Coin selector configured with dust and size policy
#[derive(Debug, Clone)]
pub struct CoinSelector {
    dust_threshold: u64,
    max_vsize: u64,
    max_exact_inputs: usize,
    node_budget: usize,
    output_type: AddressType,
}

impl Default for CoinSelector {
    fn default() -> Self {
        Self::new(&SelectionConfig::default())
    }
}

impl CoinSelector {
    pub fn new(config: &SelectionConfig) -> Self {
        Self {
            dust_threshold: config.dust_threshold_sat,
            max_vsize: config.max_tx_vsize,
            max_exact_inputs: config.max_exact_match_inputs,
            node_budget: config.search_node_budget,
            output_type: AddressType::NativeSegwit,
        }
    }

    pub fn dust_threshold(&self) -> u64 {
        self.dust_threshold
    }

    /// Pick the best subset of `utxos` for `request`
    pub fn select(&self, utxos: &[Utxo], request: &SelectionRequest) -> Result<SelectionResult, SelectionError> {
        if request.target == Amount::ZERO {
            return Err(SelectionError::ZeroTarget);
        }

        let candidates = utils::sort_for_selection(utxos);
        let available = utils::total_amount(&candidates);

        if available < request.target {
            return self.undersized(
                candidates,
                request,
                SelectionError::InsufficientFunds {
                    available,
                    required: request.target,
                },
            );
        }

        if request.exact_match {
            if let Some(indices) = self.find_exact(&candidates, request) {
                let selected = pick(&candidates, &indices);
                debug!("Exact match with {} input(s) for {} sat", selected.len(), request.target.to_sat());
                return Ok(self.finish(selected, request, true));
            }
            debug!("No exact match for {} sat, falling back to change-producing selection", request.target.to_sat());
        }

        let covering = match self.min_input_set(&candidates, request) {
            Some(indices) => indices,
            None => {
                let fee = self.fee_without_change(&candidates, request);
                return self.undersized(
                    candidates,
                    request,
                    SelectionError::InsufficientFundsForFee {
                        available,
                        required: saturating_add(request.target, fee),
                        fee,
                    },
                );
            }
        };

        let indices = SubsetSearch::new(self, &candidates, request, covering.len(), false)
            .run()
            .unwrap_or(covering);

        Ok(self.finish(pick(&candidates, &indices), request, false))
    }

    /// Spend every one of `utxos`, computing fee and change
    ///
    /// Used for fixed-input spends where the caller already chose the coins.
    pub fn evaluate_set(&self, utxos: &[Utxo], request: &SelectionRequest) -> Result<SelectionResult, SelectionError> {
        if request.target == Amount::ZERO {
            return Err(SelectionError::ZeroTarget);
        }

        let selected = utils::sort_for_selection(utxos);
        let total = utils::total_amount(&selected);
        if total < request.target {
            return self.undersized(
                selected,
                request,
                SelectionError::InsufficientFunds {
                    available: total,
                    required: request.target,
                },
            );
        }

        let fee = self.fee_without_change(&selected, request);
        let needed = saturating_add(request.target, fee);
        if total < needed {
            return self.undersized(
                selected,
                request,
                SelectionError::InsufficientFundsForFee {
                    available: total,
                    required: needed,
                    fee,
                },
            );
        }

        let exact = total == needed;
        Ok(self.finish(selected, request, exact))
    }

    fn fee_without_change(&self, inputs: &[Utxo], request: &SelectionRequest) -> Amount {
        utils::calculate_fee(inputs, request.recipient_count, self.output_type, &request.fee)
    }

    /// Fewest candidates covering target plus fee, as sorted indices
    ///
    /// With a per-vbyte fee a large input can cost more than it adds, so value
    /// order is not enough. Ranked by effective value, the best subset of any
    /// size is a prefix of the ranking and the first covering prefix is minimal.
    fn min_input_set(&self, candidates: &[Utxo], request: &SelectionRequest) -> Option<Vec<usize>> {
        let effective: Vec<f64> = candidates
            .iter()
            .map(|utxo| utils::effective_value(utxo, &request.fee))
            .collect();

        let mut ranked: Vec<usize> = (0..candidates.len()).collect();
        // stable sort, ties keep selection order
        ranked.sort_by(|&a, &b| effective[b].total_cmp(&effective[a]));

        let mut sum = Amount::ZERO;
        for (k, &index) in ranked.iter().enumerate() {
            sum += candidates[index].amount;
            let prefix = ranked[..=k].iter().map(|&i| &candidates[i]);
            let fee = utils::calculate_fee(prefix, request.recipient_count, self.output_type, &request.fee);
            if sum >= saturating_add(request.target, fee) {
                let mut indices = ranked[..=k].to_vec();
                indices.sort_unstable();
                return Some(indices);
            }
        }
        None
    }

    fn find_exact(&self, candidates: &[Utxo], request: &SelectionRequest) -> Option<Vec<usize>> {
        let max_inputs = self.max_exact_inputs.min(candidates.len());
        (1..=max_inputs).find_map(|k| SubsetSearch::new(self, candidates, request, k, true).run())
    }

    /// Build the result for a chosen subset
    fn finish(&self, selected: Vec<Utxo>, request: &SelectionRequest, exact: bool) -> SelectionResult {
        let total = utils::total_amount(&selected);
        let recipients = request.recipient_count;
        let fee_with_change = utils::calculate_fee(&selected, recipients + 1, self.output_type, &request.fee);
        let threshold = utils::change_threshold(&request.fee, self.dust_threshold, self.output_type);

        let change = if exact {
            None
        } else {
            request
                .target
                .checked_add(fee_with_change)
                .and_then(|needed| total.checked_sub(needed))
                .filter(|change| *change >= threshold)
        };

        let (fee, change, has_change, outputs) = match change {
            Some(change) => (fee_with_change, change, true, recipients + 1),
            None => (total - request.target, Amount::ZERO, false, recipients),
        };

        let vsize = utils::transaction_vsize(&selected, outputs, self.output_type);
        let exceeds_size_limit = vsize > self.max_vsize;
        if exceeds_size_limit {
            warn!(
                "Selected {} inputs, estimated {} vB exceeds the {} vB limit",
                selected.len(),
                vsize,
                self.max_vsize
            );
        }

        SelectionResult {
            selected,
            total,
            fee,
            change,
            has_change,
            exact_match: exact,
            vsize,
            exceeds_size_limit,
            sufficient: true,
        }
    }

    /// Either fail, or hand back everything with `sufficient == false`
    fn undersized(
        &self,
        candidates: Vec<Utxo>,
        request: &SelectionRequest,
        error: SelectionError,
    ) -> Result<SelectionResult, SelectionError> {
        if request.check_amount {
            debug!("Selection failed: {}", error);
            return Err(error);
        }

        let total = utils::total_amount(&candidates);
        let fee = self.fee_without_change(&candidates, request);
        let vsize = utils::transaction_vsize(&candidates, request.recipient_count, self.output_type);
        Ok(SelectionResult {
            selected: candidates,
            total,
            fee,
            change: Amount::ZERO,
            has_change: false,
            exact_match: false,
            vsize,
            exceeds_size_limit: vsize > self.max_vsize,
            sufficient: false,
        })
    }
}

fn saturating_add(a: Amount, b: Amount) -> Amount {
    a.checked_add(b).unwrap_or(Amount::from_sat(u64::MAX))
}

fn pick(candidates: &[Utxo], indices: &[usize]) -> Vec<Utxo> {
    indices.iter().map(|&i| candidates[i].clone()).collect()
}

/// Depth-first search over fixed-size subsets of the sorted candidates
struct SubsetSearch<'a> {
    values: Vec<u64>,
    input_vsizes: Vec<u64>,
    /// `prefix[i]` is the sum of the first `i` values
    prefix: Vec<u64>,
    size: usize,
    target: u64,
    fee: &'a FeeSpec,
    /// vsize of everything except the inputs
    base_vsize: u64,
    fee_low: u64,
    fee_high: u64,
    exact: bool,
    budget: usize,
    visited: usize,
    current: Vec<usize>,
    current_sum: u64,
    current_vsize: u64,
    best: Option<(u64, Vec<usize>)>,
}

impl<'a> SubsetSearch<'a> {
    fn new(
        selector: &CoinSelector,
        candidates: &[Utxo],
        request: &'a SelectionRequest,
        size: usize,
        exact: bool,
    ) -> Self {
        let values: Vec<u64> = candidates.iter().map(|u| u.amount.to_sat()).collect();
        let input_vsizes: Vec<u64> = candidates.iter().map(Utxo::input_vsize).collect();
        let mut prefix = Vec::with_capacity(values.len() + 1);
        prefix.push(0u64);
        for value in &values {
            let last = prefix[prefix.len() - 1];
            prefix.push(last.saturating_add(*value));
        }

        let base_vsize =
            TX_OVERHEAD_VSIZE + request.recipient_count as u64 * selector.output_type.output_vsize();
        let min_input = input_vsizes.iter().copied().min().unwrap_or(0);
        let max_input = input_vsizes.iter().copied().max().unwrap_or(0);
        let fee_low = request.fee.fee_for_vsize(base_vsize + size as u64 * min_input).to_sat();
        let fee_high = request.fee.fee_for_vsize(base_vsize + size as u64 * max_input).to_sat();

        Self {
            values,
            input_vsizes,
            prefix,
            size,
            target: request.target.to_sat(),
            fee: &request.fee,
            base_vsize,
            fee_low,
            fee_high,
            exact,
            budget: selector.node_budget,
            visited: 0,
            current: Vec::with_capacity(size),
            current_sum: 0,
            current_vsize: 0,
            best: None,
        }
    }

    fn run(mut self) -> Option<Vec<usize>> {
        if self.size == 0 || self.size > self.values.len() {
            return None;
        }
        self.descend(0);
        if self.visited >= self.budget {
            debug!("Subset search stopped after {} nodes", self.visited);
        }
        self.best.map(|(_, indices)| indices)
    }

    fn finished(&self) -> bool {
        self.visited >= self.budget || matches!(self.best, Some((0, _)))
    }

    fn descend(&mut self, start: usize) {
        if self.finished() {
            return;
        }
        self.visited += 1;

        if self.current.len() == self.size {
            self.evaluate_leaf();
            return;
        }

        let n = self.values.len();
        let remaining = self.size - self.current.len();
        // sum of the `remaining - 1` smallest values
        let smallest_rest = self.prefix[n] - self.prefix[n - (remaining - 1)];

        for i in start..=(n - remaining) {
            if self.finished() {
                return;
            }

            // largest reachable sum shrinks as `i` moves right
            let max_sum = self.current_sum.saturating_add(self.prefix[i + remaining] - self.prefix[i]);
            if max_sum < self.target.saturating_add(self.fee_low) {
                break;
            }

            let min_sum = self.current_sum.saturating_add(self.values[i]).saturating_add(smallest_rest);
            let ceiling = self.target.saturating_add(self.fee_high);
            if self.exact {
                if min_sum > ceiling {
                    continue;
                }
            } else if let Some((best_excess, _)) = &self.best {
                if min_sum >= ceiling.saturating_add(*best_excess) {
                    continue;
                }
            }

            self.current.push(i);
            self.current_sum += self.values[i];
            self.current_vsize += self.input_vsizes[i];
            self.descend(i + 1);
            self.current_vsize -= self.input_vsizes[i];
            self.current_sum -= self.values[i];
            self.current.pop();
        }
    }

    fn evaluate_leaf(&mut self) {
        let fee = self.fee.fee_for_vsize(self.base_vsize + self.current_vsize).to_sat();
        let needed = self.target.saturating_add(fee);
        if self.current_sum < needed {
            return;
        }

        let excess = self.current_sum - needed;
        if self.exact && excess != 0 {
            return;
        }

        let improves = match &self.best {
            Some((best_excess, _)) => excess < *best_excess,
            None => true,
        };
        if improves {
            self.best = Some((excess, self.current.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::{OutPoint, Txid};
    use std::str::FromStr;

    fn utxo(tag: char, sats: u64) -> Utxo {
        let txid = Txid::from_str(&tag.to_string().repeat(64)).unwrap();
        Utxo::new(OutPoint::new(txid, 0), Amount::from_sat(sats), 6)
    }

    #[test]
    fn test_prefers_fewer_inputs_then_least_excess() {
        let utxos = vec![utxo('a', 50_000), utxo('b', 30_000), utxo('c', 20_000)];
        let request = SelectionRequest::new(Amount::from_sat(60_000), FeeSpec::Fixed(2_000));

        let result = CoinSelector::default().select(&utxos, &request).unwrap();

        assert_eq!(result.total, Amount::from_sat(70_000));
        assert_eq!(result.change, Amount::from_sat(8_000));
        assert!(result.has_change);
        assert_eq!(result.fee, Amount::from_sat(2_000));
    }

    #[test]
    fn test_cheaper_input_beats_larger_legacy_input() {
        let legacy = utxo('a', 13_500).with_address_type(AddressType::Legacy);
        let segwit = utxo('b', 13_000);
        let request = SelectionRequest::new(Amount::from_sat(1_000), FeeSpec::PerVbyte(100.0));

        let result = CoinSelector::default().select(&[legacy, segwit.clone()], &request).unwrap();

        assert_eq!(result.selected, vec![segwit]);
        // 11 + 68 + 31 vB at 100 sat/vB, change too small to keep
        assert_eq!(result.fee, Amount::from_sat(12_000));
        assert!(!result.has_change);
    }

    #[test]
    fn test_huge_fee_rate_reports_insufficient_funds() {
        let request = SelectionRequest::new(Amount::from_sat(1_000), FeeSpec::PerVbyte(1e18));

        let error = CoinSelector::default().select(&[utxo('a', 50_000)], &request).unwrap_err();

        assert!(matches!(
            error,
            SelectionError::InsufficientFundsForFee { fee, .. } if fee == Amount::MAX_MONEY
        ));
    }

    #[test]
    fn test_search_respects_node_budget() {
        let config = SelectionConfig {
            search_node_budget: 3,
            ..SelectionConfig::default()
        };
        let utxos: Vec<Utxo> = ['1', '2', '3', '4', '5', '6']
            .iter()
            .map(|c| utxo(*c, 10_000))
            .collect();
        let request = SelectionRequest::new(Amount::from_sat(25_000), FeeSpec::zero());

        let result = CoinSelector::new(&config).select(&utxos, &request).unwrap();

        assert_eq!(result.input_count(), 3);
        assert!(result.sufficient);
    }

    #[test]
    fn test_zero_target_rejected() {
        let request = SelectionRequest::new(Amount::ZERO, FeeSpec::zero());
        assert_eq!(
            CoinSelector::default().select(&[utxo('a', 1_000)], &request),
            Err(SelectionError::ZeroTarget)
        );
    }

    #[test]
    fn test_evaluate_set_uses_every_input() {
        let utxos = vec![utxo('a', 40_000), utxo('b', 40_000)];
        let request = SelectionRequest::new(Amount::from_sat(50_000), FeeSpec::PerVbyte(1.0));

        let result = CoinSelector::default().evaluate_set(&utxos, &request).unwrap();

        assert_eq!(result.input_count(), 2);
        assert!(result.has_change);
        assert_eq!(result.total, result.fee + result.change + Amount::from_sat(50_000));
    }
}
