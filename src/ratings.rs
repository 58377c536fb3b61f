// Rating Aggregator
// Product ratings are always recomputed from the full review set, never adjusted
// incrementally, so the stored summary cannot drift from the reviews.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatingSummary {
    // floor(sum / count), 0 without reviews
    pub average: u32,
    pub count: u32,
}

pub fn recompute_ratings<I>(ratings: I) -> RatingSummary
where
    I: IntoIterator<Item = u8>,
{
    let (sum, count) = ratings
        .into_iter()
        .fold((0u64, 0u32), |(sum, count), rating| {
            (sum + rating as u64, count + 1)
        });

    if count == 0 {
        return RatingSummary::default();
    }

    RatingSummary {
        average: (sum / count as u64) as u32,
        count,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_reviews() {
        assert_eq!(
            recompute_ratings(Vec::new()),
            RatingSummary {
                average: 0,
                count: 0
            }
        );
    }

    #[test]
    fn test_average_is_floored() {
        assert_eq!(
            recompute_ratings(vec![4, 5]),
            RatingSummary {
                average: 4,
                count: 2
            }
        );
        assert_eq!(recompute_ratings(vec![1, 2, 2]).average, 1);
        assert_eq!(recompute_ratings(vec![5; 1000]).average, 5);
    }
}
