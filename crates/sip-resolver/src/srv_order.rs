//! RFC 2782 target selection.
//!
//! Records are grouped by ascending priority. Inside a group the next
//! record is drawn with probability proportional to its weight: zero-weight
//! records go first in the candidate list, a running weight sum is built,
//! a number is drawn from `0..=sum` and the first record whose running sum
//! reaches it is taken. Zero-weight records can still be drawn when the
//! number is 0.

use rand::Rng;

use crate::records::MatchedSrv;

pub fn order_srv<R: Rng + ?Sized>(mut records: Vec<MatchedSrv>, rng: &mut R) -> Vec<MatchedSrv> {
    records.sort_by_key(|r| r.record.priority);
    let mut ordered = Vec::with_capacity(records.len());
    let mut rest = records.into_iter().peekable();
    while let Some(first) = rest.next() {
        let priority = first.record.priority;
        let mut group = vec![first];
        while let Some(next) = rest.next_if(|r| r.record.priority == priority) {
            group.push(next);
        }
        select_by_weight(group, rng, &mut ordered);
    }
    ordered
}

fn select_by_weight<R: Rng + ?Sized>(
    mut group: Vec<MatchedSrv>,
    rng: &mut R,
    out: &mut Vec<MatchedSrv>,
) {
    // stable: zero weights first, otherwise keep the answer order
    group.sort_by_key(|r| r.record.weight != 0);
    while !group.is_empty() {
        let sum: u32 = group.iter().map(|r| u32::from(r.record.weight)).sum();
        let pick = rng.gen_range(0..=sum);
        let mut running = 0u32;
        let mut chosen = group.len() - 1;
        for (i, record) in group.iter().enumerate() {
            running += u32::from(record.record.weight);
            if running >= pick {
                chosen = i;
                break;
            }
        }
        out.push(group.remove(chosen));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{Matched, SrvRecord};
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn srv(priority: u16, weight: u16, target: &str) -> MatchedSrv {
        Matched::dns(SrvRecord::new("_sip._udp.example.com", 60, priority, weight, 5060, target))
    }

    #[test]
    fn priorities_are_never_mixed() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..50 {
            let ordered = order_srv(
                vec![srv(20, 100, "c"), srv(10, 1, "a"), srv(30, 0, "d"), srv(10, 50, "b")],
                &mut rng,
            );
            let priorities: Vec<u16> = ordered.iter().map(|r| r.record.priority).collect();
            assert_eq!(priorities, vec![10, 10, 20, 30]);
        }
    }

    #[test]
    fn heavier_records_tend_to_come_first() {
        let mut rng = StdRng::seed_from_u64(42);
        let mut heavy_first = 0;
        let mut light_first = 0;
        let mut zero_first = 0;
        for _ in 0..2000 {
            let ordered = order_srv(
                vec![srv(10, 90, "heavy"), srv(10, 10, "light"), srv(10, 0, "zero")],
                &mut rng,
            );
            assert_eq!(ordered.len(), 3);
            match ordered[0].record.target.as_str() {
                "heavy." => heavy_first += 1,
                "light." => light_first += 1,
                _ => zero_first += 1,
            }
        }
        assert!(heavy_first > light_first * 4, "{heavy_first} vs {light_first}");
        assert!(light_first > 0);
        assert!(zero_first > 0);
    }

    #[test]
    fn all_zero_weights_keep_every_record() {
        let mut rng = StdRng::seed_from_u64(1);
        let ordered = order_srv(vec![srv(10, 0, "a"), srv(10, 0, "b"), srv(10, 0, "c")], &mut rng);
        let mut targets: Vec<&str> = ordered.iter().map(|r| r.record.target.as_str()).collect();
        targets.sort();
        assert_eq!(targets, vec!["a.", "b.", "c."]);
    }
}
