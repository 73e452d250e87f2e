use rand::Rng;

use crate::models::{Queue, Song};

/// Upper bound on rejection-sampling attempts when picking a shuffle
/// partner. After that many rejections the last candidate is accepted even
/// if suboptimal.
const MAX_SHUFFLE_ATTEMPTS: usize = 100;

/// Randomly reorders the queue by swapping position values pairwise.
///
/// Precondition: `songs` sorted ascending by position. The head (index 0)
/// never moves. Fewer than three songs is a structural no-op. The ">= 70% of
/// non-head songs move" property is statistical, not exact: adversarial
/// layouts can do worse after the attempt bound trips.
pub fn shuffle(songs: &mut [Song]) {
    let n = songs.len();
    if n < 3 {
        return;
    }

    let original: Vec<i64> = songs.iter().map(|song| song.position).collect();
    let mut shuffled = vec![false; n];
    let mut rng = rand::thread_rng();

    for index in 1..n {
        if shuffled[index] {
            continue;
        }

        let mut partner = index;
        for _ in 0..MAX_SHUFFLE_ATTEMPTS {
            let candidate = rng.gen_range(1..n);
            if candidate == index {
                continue;
            }
            // A partner that already holds this song's original position
            // would swap it straight back.
            if songs[candidate].position == original[index] {
                partner = candidate;
                continue;
            }
            partner = candidate;
            break;
        }
        if partner == index {
            continue;
        }

        let position = songs[index].position;
        songs[index].position = songs[partner].position;
        songs[partner].position = position;
        shuffled[index] = true;
        shuffled[partner] = true;
    }
}

/// Advances the pagination window by one page, wrapping to the first page
/// when the window would run past the end. The `+ 1` accounts for the head
/// song occupying a conceptual slot outside the window.
pub fn increment_offset(queue: &mut Queue) {
    queue.offset += queue.limit;
    if queue.offset + 1 >= queue.size {
        queue.offset = 0;
    }
}

/// Moves the pagination window back one page; from the first page it wraps
/// to the start of the last full-or-partial page.
pub fn decrement_offset(queue: &mut Queue) {
    queue.offset -= queue.limit;
    if queue.offset < 0 {
        let last = queue.size - 1;
        let mut remainder = last % queue.limit;
        if remainder == 0 {
            remainder = queue.limit;
        }
        queue.offset = (last - remainder).max(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serenity::model::id::{ChannelId, GuildId, MessageId, UserId};

    fn queue(size: i64, limit: i64, offset: i64) -> Queue {
        let mut queue = Queue::new(UserId(1), GuildId(1), ChannelId(1), MessageId(1));
        queue.size = size;
        queue.limit = limit;
        queue.offset = offset;
        queue
    }

    fn songs(n: usize) -> Vec<Song> {
        (0..n)
            .map(|index| {
                let mut song = Song::new(&format!("song {index}"));
                song.id = index as i64 + 1;
                // Gappy on purpose.
                song.position = (index as i64 + 1) * 3;
                song
            })
            .collect()
    }

    #[test]
    fn increment_wraps_when_window_passes_the_end() {
        let mut q = queue(13, 10, 0);
        increment_offset(&mut q);
        assert_eq!(q.offset, 10);
        increment_offset(&mut q);
        assert_eq!(q.offset, 0);
    }

    #[test]
    fn increment_stays_within_larger_queues() {
        let mut q = queue(22, 10, 0);
        increment_offset(&mut q);
        increment_offset(&mut q);
        assert_eq!(q.offset, 20);
    }

    #[test]
    fn decrement_is_left_inverse_without_wraparound() {
        for size in [22, 35, 101] {
            for start in [10, 20] {
                let mut q = queue(size, 10, start);
                increment_offset(&mut q);
                if q.offset == 0 {
                    continue; // wrapped, inverse does not apply
                }
                decrement_offset(&mut q);
                assert_eq!(q.offset, start, "size {size}, start {start}");
            }
        }
    }

    #[test]
    fn decrement_from_first_page_lands_on_last_page() {
        let mut q = queue(22, 10, 0);
        decrement_offset(&mut q);
        assert_eq!(q.offset, 20);

        // Exact multiple: the last page is a full one.
        let mut q = queue(21, 10, 0);
        decrement_offset(&mut q);
        assert_eq!(q.offset, 10);
    }

    #[test]
    fn shuffle_is_a_no_op_below_three_songs() {
        let mut pair = songs(2);
        let before: Vec<i64> = pair.iter().map(|song| song.position).collect();
        shuffle(&mut pair);
        let after: Vec<i64> = pair.iter().map(|song| song.position).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn shuffle_never_moves_the_head() {
        for n in [3, 5, 17, 100] {
            let mut list = songs(n);
            let head = list[0].position;
            shuffle(&mut list);
            assert_eq!(list[0].position, head, "n = {n}");
        }
    }

    #[test]
    fn shuffle_moves_most_songs() {
        // Statistical property: averaged over many trials, at least ~70% of
        // the non-head songs land on a different position.
        let mut moved = 0usize;
        let mut total = 0usize;
        for n in [3usize, 4, 7, 10, 25, 60, 150, 400, 999] {
            for _ in 0..20 {
                let mut list = songs(n);
                let before: Vec<i64> = list.iter().map(|song| song.position).collect();
                shuffle(&mut list);
                moved += list
                    .iter()
                    .zip(&before)
                    .skip(1)
                    .filter(|(song, old)| song.position != **old)
                    .count();
                total += n - 1;
            }
        }
        let fraction = moved as f64 / total as f64;
        assert!(fraction >= 0.70, "only {fraction:.2} of songs moved");
    }

    #[test]
    fn shuffle_preserves_the_position_set() {
        let mut list = songs(25);
        let mut before: Vec<i64> = list.iter().map(|song| song.position).collect();
        shuffle(&mut list);
        let mut after: Vec<i64> = list.iter().map(|song| song.position).collect();
        before.sort_unstable();
        after.sort_unstable();
        assert_eq!(before, after);
    }
}
